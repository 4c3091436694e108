// Integration tests for microphone capture from WAV files
//
// Both processing strategies must produce the same frames and speech events.

mod common;

use anyhow::Result;
use common::write_tone_wav;
use tempfile::TempDir;
use tokio::sync::mpsc;
use voice_coach::capture::{CaptureStatus, DeviceCapabilities};
use voice_coach::{
    start_capture, AudioProfile, CaptureError, CaptureEvent, CaptureOptions, CaptureStrategy,
    Preloader, ProfileTier, WavMicrophone, WsConnector,
};

async fn collect(mut events: mpsc::UnboundedReceiver<CaptureEvent>) -> Vec<CaptureEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(std::time::Duration::from_secs(5), events.recv()).await
    {
        let ended = event == CaptureEvent::Status(CaptureStatus::Ended);
        out.push(event);
        if ended {
            break;
        }
    }
    out
}

fn frames(events: &[CaptureEvent]) -> Vec<&voice_coach::AudioFrame> {
    events
        .iter()
        .filter_map(|e| match e {
            CaptureEvent::Frame(frame) => Some(frame),
            _ => None,
        })
        .collect()
}

fn speech_edges(events: &[CaptureEvent]) -> Vec<&CaptureEvent> {
    events
        .iter()
        .filter(|e| matches!(e, CaptureEvent::SpeechStart | CaptureEvent::SpeechEnd))
        .collect()
}

async fn run_capture(
    microphone: WavMicrophone,
    options: CaptureOptions,
) -> Result<(CaptureStrategy, Vec<CaptureEvent>)> {
    let (handle, events) = start_capture(Box::new(microphone), options, None).await?;
    let strategy = handle.strategy();
    let events = collect(events).await;
    handle.stop().await;
    assert!(!handle.is_running().await);
    Ok((strategy, events))
}

#[tokio::test]
async fn test_audio_thread_capture_downsamples_and_frames() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mic.wav");
    // 1s at 48kHz: 0.5s tone, 0.5s silence
    write_tone_wav(&path, 48000, 1.0, 0.5);

    let options = CaptureOptions::from_profile(&AudioProfile::fallback());
    let (strategy, events) = run_capture(WavMicrophone::new(&path), options).await?;

    assert_eq!(strategy, CaptureStrategy::AudioThread);
    assert_eq!(events.first(), Some(&CaptureEvent::Status(CaptureStatus::Ready)));
    assert_eq!(events.last(), Some(&CaptureEvent::Status(CaptureStatus::Ended)));

    // 24kHz, 20ms frames: 480 samples each, 50 frames per second
    let frames = frames(&events);
    assert_eq!(frames.len(), 50);
    assert!(frames.iter().all(|f| f.len() == 480 && f.sample_rate() == 24000));

    let edges = speech_edges(&events);
    assert_eq!(edges, vec![&CaptureEvent::SpeechStart, &CaptureEvent::SpeechEnd]);

    Ok(())
}

#[tokio::test]
async fn test_inline_capture_matches_audio_thread() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mic.wav");
    write_tone_wav(&path, 48000, 1.0, 0.5);

    let options = CaptureOptions::from_profile(&AudioProfile::fallback());
    let (_, threaded) = run_capture(WavMicrophone::new(&path), options.clone()).await?;

    let inline_mic = WavMicrophone::new(&path).with_capabilities(DeviceCapabilities {
        audio_thread: false,
        ..DeviceCapabilities::default()
    });
    let (strategy, inline) = run_capture(inline_mic, options).await?;

    assert_eq!(strategy, CaptureStrategy::Inline);
    assert_eq!(threaded, inline);
    Ok(())
}

#[tokio::test]
async fn test_low_profile_frames() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mic.wav");
    write_tone_wav(&path, 16000, 0.6, 0.0);

    let options = CaptureOptions::from_profile(&AudioProfile::for_tier(ProfileTier::Low));
    let (_, events) = run_capture(WavMicrophone::new(&path), options).await?;

    // 16kHz, 60ms frames: 960 samples, no resampling
    let frames = frames(&events);
    assert_eq!(frames.len(), 10);
    assert!(frames.iter().all(|f| f.len() == 960));
    assert!(speech_edges(&events).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_native_rate_below_target_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mic.wav");
    write_tone_wav(&path, 8000, 0.1, 0.1);

    let options = CaptureOptions::from_profile(&AudioProfile::fallback());
    let result = start_capture(Box::new(WavMicrophone::new(&path)), options, None).await;

    match result {
        Err(CaptureError::UnsupportedSampleRate { native, target }) => {
            assert_eq!(native, 8000);
            assert_eq!(target, 24000);
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("capture should not start"),
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_capabilities_are_unsupported() {
    let mic = WavMicrophone::new("/nonexistent.wav").with_capabilities(DeviceCapabilities {
        microphone: true,
        audio_thread: false,
        block_processor: false,
    });
    assert!(!voice_coach::capture::is_supported(&mic));

    let result = start_capture(Box::new(mic), CaptureOptions::default(), None).await;
    assert!(matches!(result, Err(CaptureError::Unsupported(_))));
}

#[tokio::test]
async fn test_missing_file_fails_to_open() {
    let result = start_capture(
        Box::new(WavMicrophone::new("/nonexistent/mic.wav")),
        CaptureOptions::default(),
        None,
    )
    .await;
    assert!(matches!(result, Err(CaptureError::Wav(_))));
}

#[tokio::test]
async fn test_capture_claims_preloaded_audio_thread() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mic.wav");
    write_tone_wav(&path, 24000, 0.2, 0.0);

    let preloader = Preloader::new(std::sync::Arc::new(WsConnector));
    preloader.preload(true);
    preloader.wait().await;
    assert!(preloader.is_complete());

    let pool = preloader.audio_pool();
    assert_eq!(pool.state(), voice_coach::PoolState::Ready);

    let options = CaptureOptions::from_profile(&AudioProfile::fallback());
    let (handle, events) =
        start_capture(Box::new(WavMicrophone::new(&path)), options, Some(&pool)).await?;
    assert_eq!(handle.strategy(), CaptureStrategy::AudioThread);
    assert_eq!(pool.state(), voice_coach::PoolState::Uninitialized);

    let events = collect(events).await;
    assert_eq!(frames(&events).len(), 10);
    handle.stop().await;
    Ok(())
}
