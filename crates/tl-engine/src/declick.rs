//! Declick envelope
//!
//! Starts fade in and stops/locates fade out over a few milliseconds so the
//! transport never cuts audio mid-waveform. The envelope runs on the process
//! thread, cycle by cycle; a fade may span several cycles when the declick is
//! longer than the block.

/// Gain ramp for one cycle: linear from `start_gain` to `end_gain` over the
/// first `frames` samples, then held at `end_gain`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeclickRamp {
    pub start_gain: f32,
    pub end_gain: f32,
    pub frames: usize,
}

impl DeclickRamp {
    pub const UNITY: Self = Self {
        start_gain: 1.0,
        end_gain: 1.0,
        frames: 0,
    };

    pub const SILENT: Self = Self {
        start_gain: 0.0,
        end_gain: 0.0,
        frames: 0,
    };

    #[inline]
    pub fn is_unity(&self) -> bool {
        self.start_gain == 1.0 && self.end_gain == 1.0
    }

    /// Gain at frame `i` of the cycle
    #[inline]
    pub fn gain_at(&self, i: usize) -> f32 {
        if i >= self.frames {
            self.end_gain
        } else {
            let t = i as f32 / self.frames as f32;
            self.start_gain + (self.end_gain - self.start_gain) * t
        }
    }

    /// Apply to one channel of audio in place
    pub fn apply(&self, buffer: &mut [f32]) {
        if self.is_unity() {
            return;
        }
        for (i, sample) in buffer.iter_mut().enumerate() {
            *sample *= self.gain_at(i);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclickPhase {
    Idle,
    FadeIn,
    FadeOut,
}

/// What finished during a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclickOutcome {
    Running,
    FadeInComplete,
    FadeOutComplete,
}

#[derive(Debug)]
pub struct Declicker {
    length: u64,
    phase: DeclickPhase,
    /// Samples of the current fade already produced
    done: u64,
}

impl Declicker {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            phase: DeclickPhase::Idle,
            done: 0,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    #[inline]
    pub fn phase(&self) -> DeclickPhase {
        self.phase
    }

    /// Current envelope gain
    fn gain(&self) -> f32 {
        if self.length == 0 {
            return match self.phase {
                DeclickPhase::FadeIn => 0.0,
                _ => 1.0,
            };
        }
        let progress = self.done as f32 / self.length as f32;
        match self.phase {
            DeclickPhase::Idle => 1.0,
            DeclickPhase::FadeIn => progress,
            DeclickPhase::FadeOut => 1.0 - progress,
        }
    }

    pub fn fade_in(&mut self) {
        // Reversing a fade-out midway starts the fade-in from the same gain
        self.done = match self.phase {
            DeclickPhase::FadeOut => self.length - self.done,
            _ => 0,
        };
        self.phase = DeclickPhase::FadeIn;
    }

    pub fn fade_out(&mut self) {
        self.done = match self.phase {
            DeclickPhase::FadeIn => self.length - self.done,
            _ => 0,
        };
        self.phase = DeclickPhase::FadeOut;
    }

    pub fn reset(&mut self) {
        self.phase = DeclickPhase::Idle;
        self.done = 0;
    }

    /// Produce this cycle's ramp and advance the envelope by `nframes`
    pub fn run(&mut self, nframes: usize) -> (DeclickRamp, DeclickOutcome) {
        if self.phase == DeclickPhase::Idle {
            return (DeclickRamp::UNITY, DeclickOutcome::Running);
        }

        let start_gain = self.gain();
        let remaining = self.length - self.done;
        let used = remaining.min(nframes as u64);
        self.done += used;
        let end_gain = match (self.phase, self.done >= self.length) {
            (DeclickPhase::FadeIn, true) => 1.0,
            (DeclickPhase::FadeOut, true) => 0.0,
            _ => self.gain(),
        };
        let ramp = DeclickRamp {
            start_gain,
            end_gain,
            frames: used as usize,
        };

        if self.done < self.length {
            return (ramp, DeclickOutcome::Running);
        }

        let outcome = match self.phase {
            DeclickPhase::FadeIn => DeclickOutcome::FadeInComplete,
            _ => DeclickOutcome::FadeOutComplete,
        };
        self.reset();
        (ramp, outcome)
    }
}
