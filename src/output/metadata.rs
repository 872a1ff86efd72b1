//! Frame metadata records
//!
//! The capture pipeline announces each finished frame with one record. Only
//! the lengths of the detection lists matter here, so the wire form skips
//! their contents.
//!
//! Wire form, one JSON object per line:
//!
//! ```text
//! {"camera":"front","frame_time":1700000000.5,"objects":[...],"motion_boxes":[...],"regions":[...]}
//! ```

use std::io::BufRead;

use serde::de::IgnoredAny;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::frame::FrameId;

/// One queued frame announcement
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub camera: String,
    pub frame_time: f64,
    pub object_count: usize,
    pub motion_count: usize,
    pub region_count: usize,
}

#[derive(Deserialize)]
struct WireMetadata {
    camera: String,
    frame_time: f64,
    #[serde(default)]
    objects: Vec<IgnoredAny>,
    #[serde(default)]
    motion_boxes: Vec<IgnoredAny>,
    #[serde(default)]
    regions: Vec<IgnoredAny>,
}

impl FrameMetadata {
    pub fn new(camera: impl Into<String>, frame_time: f64) -> Self {
        Self {
            camera: camera.into(),
            frame_time,
            object_count: 0,
            motion_count: 0,
            region_count: 0,
        }
    }

    /// Set the number of tracked objects
    pub fn objects(mut self, count: usize) -> Self {
        self.object_count = count;
        self
    }

    /// Id of the frame buffer this record announces
    pub fn frame_id(&self) -> FrameId {
        FrameId::new(self.camera.clone(), self.frame_time)
    }

    /// Parse one wire record
    pub fn from_json(line: &str) -> Result<Self> {
        let wire: WireMetadata = serde_json::from_str(line)?;
        Ok(Self {
            camera: wire.camera,
            frame_time: wire.frame_time,
            object_count: wire.objects.len(),
            motion_count: wire.motion_boxes.len(),
            region_count: wire.regions.len(),
        })
    }
}

/// Read newline-delimited records from `reader` into the metadata queue.
///
/// Blocks the calling thread, so run it on a dedicated thread rather than a
/// runtime worker. A read that never returns must not hold up process exit,
/// which rules out the runtime's blocking pool.
///
/// Malformed lines are logged and skipped. Returns at end of input or when
/// the queue's receiver is gone; dropping `queue` then tells the
/// coordinator the producer is finished.
pub fn forward_records<R>(reader: R, queue: mpsc::Sender<FrameMetadata>) -> Result<u64>
where
    R: BufRead,
{
    let mut forwarded = 0;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let metadata = match FrameMetadata::from_json(&line) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed metadata record");
                continue;
            }
        };
        if queue.blocking_send(metadata).is_err() {
            break;
        }
        forwarded += 1;
    }

    tracing::debug!(records = forwarded, "Metadata input finished");
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::error::Error;

    #[test]
    fn test_parse_counts_lists() {
        let line = r#"{"camera":"front","frame_time":12.5,
            "objects":[["person",0.9,[1,2,3,4]],{"id":"x"}],
            "motion_boxes":[[0,0,10,10]],
            "regions":[]}"#;

        let metadata = assert_ok!(FrameMetadata::from_json(line));

        assert_eq!(metadata.camera, "front");
        assert_eq!(metadata.frame_time, 12.5);
        assert_eq!(metadata.object_count, 2);
        assert_eq!(metadata.motion_count, 1);
        assert_eq!(metadata.region_count, 0);
        assert_eq!(metadata.frame_id().name(), "front12.5");
    }

    #[test]
    fn test_missing_lists_default_empty() {
        let metadata = assert_ok!(FrameMetadata::from_json(r#"{"camera":"back","frame_time":3}"#));

        assert_eq!(metadata, FrameMetadata::new("back", 3.0));
    }

    #[test]
    fn test_malformed_record() {
        let result = FrameMetadata::from_json(r#"{"frame_time":1.0}"#);
        assert!(matches!(assert_err!(result), Error::Metadata(_)));
    }

    #[test]
    fn test_forward_records_skips_bad_lines() {
        let input = concat!(
            r#"{"camera":"front","frame_time":1.0,"objects":[1]}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"camera":"back","frame_time":2.0}"#,
            "\n",
        );
        let (tx, mut rx) = mpsc::channel(8);

        let forwarded = assert_ok!(forward_records(input.as_bytes(), tx));

        assert_eq!(forwarded, 2);
        assert_eq!(rx.blocking_recv(), Some(FrameMetadata::new("front", 1.0).objects(1)));
        assert_eq!(rx.blocking_recv(), Some(FrameMetadata::new("back", 2.0)));
        // Sender dropped once input ended
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn test_forward_records_stops_when_queue_gone() {
        let input = "{\"camera\":\"a\",\"frame_time\":1}\n{\"camera\":\"a\",\"frame_time\":2}\n";
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let forwarded = assert_ok!(forward_records(input.as_bytes(), tx));

        assert_eq!(forwarded, 0);
    }
}
