/// A named progress event with an overall fraction in `[0, 1]`.
///
/// The engines push these through an optional callback; nothing in the core
/// depends on the sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub phase: &'static str,
    pub fraction: f64,
}

/// Callback parameter type used by the engine entry points.
pub type ProgressSink<'a> = Option<&'a mut dyn FnMut(ProgressEvent)>;

pub(crate) fn emit(progress: &mut ProgressSink<'_>, phase: &'static str, fraction: f64) {
    if let Some(callback) = progress.as_deref_mut() {
        callback(ProgressEvent { phase, fraction });
    }
}

/// A sub-interval `[offset, offset + span]` of the overall progress bar,
/// apportioned per version or per engine phase.
#[derive(Debug, Clone, Copy)]
pub struct ProgressRange {
    pub offset: f64,
    pub span: f64,
}

impl ProgressRange {
    pub fn full() -> Self {
        Self {
            offset: 0.0,
            span: 1.0,
        }
    }

    /// The sub-range covering `[start, end]` (fractions of this range).
    pub fn slice(&self, start: f64, end: f64) -> Self {
        Self {
            offset: self.offset + self.span * start,
            span: self.span * (end - start),
        }
    }

    /// Map a local fraction into the overall bar.
    pub fn at(&self, fraction: f64) -> f64 {
        self.offset + self.span * fraction.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_and_at() {
        let full = ProgressRange::full();
        assert_eq!(full.at(0.5), 0.5);

        // trailing 25% of the bar, as handed to a post-purge compact
        let tail = full.slice(0.75, 1.0);
        assert!((tail.at(0.0) - 0.75).abs() < 1e-9);
        assert!((tail.at(1.0) - 1.0).abs() < 1e-9);
        assert!((tail.at(0.5) - 0.875).abs() < 1e-9);
    }

    #[test]
    fn at_clamps() {
        let r = ProgressRange::full().slice(0.2, 0.4);
        assert!((r.at(-1.0) - 0.2).abs() < 1e-9);
        assert!((r.at(2.0) - 0.4).abs() < 1e-9);
    }
}
