//! C6 — Local Detector (external contract).
//!
//! The core never performs image capture or person detection itself; it
//! calls out to a collaborator through this trait once per DETECT phase.
//! The core imposes no latency contract beyond "must return within the
//! cycle time budget" — if a detector blocks past that, the cycle proceeds
//! with whatever the COLLECT phase already has.

use dtrack_types::Detection;

/// Produces, on demand, the set of detections visible "this instant".
/// Implementations are expected to capture an image, identify persons,
/// project each one's bottom-center image point to a world-plane position,
/// and assign a node-local monotonic `tracking_id`. A detector that cannot
/// produce a world position for a given person (e.g. missing calibration)
/// still returns the detection with `world_position: None`.
pub trait LocalDetector: Send {
    fn detect(&mut self) -> Vec<Detection>;
}

/// A detector with no camera behind it: always reports zero detections.
/// Used in tests and as the fallback when a calibration file is missing or
/// invalid — an external concern; the core keeps cycling regardless.
#[derive(Debug, Default)]
pub struct NullDetector;

impl LocalDetector for NullDetector {
    fn detect(&mut self) -> Vec<Detection> {
        Vec::new()
    }
}

/// A detector that replays a fixed script of detections, one entry per
/// call, holding on the last entry once exhausted. Useful for exercising
/// the cycle engine deterministically in tests.
#[derive(Debug, Default)]
pub struct ScriptedDetector {
    script: Vec<Vec<Detection>>,
    cursor: usize,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<Detection>>) -> Self {
        Self { script, cursor: 0 }
    }
}

impl LocalDetector for ScriptedDetector {
    fn detect(&mut self) -> Vec<Detection> {
        if self.script.is_empty() {
            return Vec::new();
        }
        let frame = self.script[self.cursor.min(self.script.len() - 1)].clone();
        if self.cursor < self.script.len() - 1 {
            self.cursor += 1;
        }
        frame
    }
}

/// A detector that always panics. Exercises the cycle engine's recovery
/// path for an external detector failure (spec: the cycle proceeds with an
/// empty local detection list rather than taking the node down).
#[derive(Debug, Default)]
pub struct PanickingDetector;

impl LocalDetector for PanickingDetector {
    fn detect(&mut self) -> Vec<Detection> {
        panic!("simulated local detector failure")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtrack_types::{BoundingBox, WorldPosition};

    fn detection(tracking_id: u64) -> Detection {
        Detection {
            tracking_id,
            confidence: 90.0,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
            world_position: Some(WorldPosition { x: 1.0, y: 0.0, z: 2.0 }),
        }
    }

    #[test]
    fn null_detector_always_reports_nothing() {
        let mut detector = NullDetector;
        assert!(detector.detect().is_empty());
        assert!(detector.detect().is_empty());
    }

    #[test]
    fn scripted_detector_advances_then_holds_last_frame() {
        let mut detector = ScriptedDetector::new(vec![vec![detection(1)], vec![detection(2)]]);
        assert_eq!(detector.detect()[0].tracking_id, 1);
        assert_eq!(detector.detect()[0].tracking_id, 2);
        assert_eq!(detector.detect()[0].tracking_id, 2, "holds on the last scripted frame");
    }

    #[test]
    fn scripted_detector_with_empty_script_reports_nothing() {
        let mut detector = ScriptedDetector::new(vec![]);
        assert!(detector.detect().is_empty());
    }
}
