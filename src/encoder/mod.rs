//! Encoder channels
//!
//! An encoder channel is an opaque byte-stream transform with a lifecycle:
//! raw frames go in, encoded container bytes come out. The two directions
//! are split so the coordinator can feed frames while the channel's relay
//! drains output concurrently.
//!
//! ```text
//!   Coordinator ──write()──► [EncoderInput]  ~ subprocess ~  [EncoderOutput] ──read()──► Relay
//!               ──exit()───►
//! ```

pub mod process;

use std::future::Future;

use bytes::Bytes;

use crate::config::EncoderConfig;
use crate::error::Result;
use crate::frame::FrameShape;

pub use process::{ProcessEncoder, ProcessOutput};

/// How an encoder ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited within the grace period after the terminate request
    Graceful,
    /// Did not exit in time and was killed
    Killed,
}

/// Write side of an encoder channel
pub trait EncoderInput: Send {
    /// Push one raw frame. Waits while the encoder applies backpressure.
    ///
    /// Fails with `EncoderDead` once the encoder's input is closed.
    fn write(&mut self, frame: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Stop the encoder: request termination, wait out the grace period,
    /// then kill. The encoder is reaped before this returns.
    fn exit(&mut self) -> impl Future<Output = Result<ExitOutcome>> + Send;
}

/// Read side of an encoder channel
pub trait EncoderOutput: Send + 'static {
    /// Return up to `max_len` encoded bytes.
    ///
    /// Waits until data is available; an empty chunk means end of stream.
    fn read(&mut self, max_len: usize) -> impl Future<Output = Result<Bytes>> + Send;

    /// Whether the encoder has exited
    fn has_exited(&self) -> bool;
}

/// Program and arguments used to launch an encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Encoding parameters for one channel
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub program: String,
    pub input: FrameShape,
    pub output: FrameShape,
    pub bitrate: String,
}

impl EncoderSettings {
    /// Settings for a channel whose raw frames have shape `input`
    pub fn from_config(config: &EncoderConfig, input: FrameShape) -> Self {
        Self {
            program: config.program.clone(),
            input,
            output: FrameShape::new(config.output_width, config.output_height),
            bitrate: config.bitrate.clone(),
        }
    }

    /// ffmpeg invocation: raw yuv420p on stdin, MPEG-TS with MPEG-1 video on
    /// stdout, no B-frames so viewers can decode with minimal delay.
    pub fn command(&self) -> EncoderCommand {
        let input_size = self.input.to_string();
        let output_size = self.output.to_string();
        EncoderCommand::new(
            self.program.clone(),
            [
                "-f",
                "rawvideo",
                "-pix_fmt",
                "yuv420p",
                "-video_size",
                input_size.as_str(),
                "-i",
                "pipe:",
                "-f",
                "mpegts",
                "-s",
                output_size.as_str(),
                "-codec:v",
                "mpeg1video",
                "-b:v",
                self.bitrate.as_str(),
                "-bf",
                "0",
                "pipe:",
            ],
        )
    }
}
