use crate::audio::dsp::{downsample, float_to_pcm16};
use crate::audio::{frame_len, ActivityConfig, ActivityDetector, AudioFrame, SpeechTransition};

/// Lifecycle notices from the capture engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Microphone acquired, frames will follow
    Ready,
    /// Input stream ended
    Ended,
}

/// Everything the capture engine reports, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Frame(AudioFrame),
    Status(CaptureStatus),
    SpeechStart,
    SpeechEnd,
    Activity { speaking: bool, level: f32 },
}

/// Resample, frame and classify raw input blocks.
///
/// Blocks arrive at the device rate in whatever size the device delivers;
/// output frames are exactly `frame_size` samples at the target rate.
#[derive(Debug)]
pub struct FrameProcessor {
    input_rate: u32,
    target_rate: u32,
    frame_size: usize,
    pending: Vec<f32>,
    detector: ActivityDetector,
}

impl FrameProcessor {
    pub fn new(input_rate: u32, target_rate: u32, activity: ActivityConfig) -> Self {
        let frame_size = frame_len(target_rate, activity.frame_duration_ms).max(1);
        Self {
            input_rate,
            target_rate,
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
            detector: ActivityDetector::new(activity),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Consume one input block and return the events it completes.
    pub fn process(&mut self, block: &[f32]) -> Vec<CaptureEvent> {
        let resampled = downsample(block, self.input_rate, self.target_rate);
        self.pending.extend_from_slice(&resampled);

        let mut events = Vec::new();
        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            let pcm = float_to_pcm16(&frame);

            match self.detector.update(&pcm) {
                Some(SpeechTransition::Start) => events.push(CaptureEvent::SpeechStart),
                Some(SpeechTransition::End) => events.push(CaptureEvent::SpeechEnd),
                None => {}
            }
            events.push(CaptureEvent::Activity {
                speaking: self.detector.is_active(),
                level: self.detector.level(),
            });
            events.push(CaptureEvent::Frame(AudioFrame::new(pcm, self.target_rate)));
        }

        events
    }

    /// Samples buffered towards the next frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
