//! The takeover audio bridge.
//!
//! While an operator owns a call, a 10 ms loop shuttles audio both ways:
//! caller audio is tailed from the stack's recorder file (position-tracked
//! past the WAV header), upsampled 8 → 48 kHz, and written into the
//! published room track; operator audio is decimated 48 → 8 kHz, batched to
//! at least 200 ms (or 150 ms since the last playback), and played back on
//! the call media as short WAV clips.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vox_audio::{
    downsample_box, pcm_from_le_bytes, upsample_linear, write_wav, TELEPHONY_RATE, WAV_HEADER_LEN,
    WEBRTC_RATE,
};
use vox_core::types::RoomName;
use vox_webrtc::{AudioPublisher, RoomClient, RoomEvent, RoomSession};

use crate::error::{Result, SipError};
use crate::stack::{CallHandle, SipStack};

const BRIDGE_TICK: Duration = Duration::from_millis(10);
/// 200 ms of 8 kHz mono.
const OPERATOR_BATCH_SAMPLES: usize = 1_600;
const OPERATOR_FLUSH_INTERVAL: Duration = Duration::from_millis(150);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Per-tick cap on recorder bytes, keeps one slow tick from ballooning.
const MAX_TAIL_BYTES: usize = 64 * 1024;

const BRIDGE_IDENTITY: &str = "voxnexus-sip-bridge";

pub struct AudioBridge {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AudioBridge {
    /// Join the bridge room, publish the caller track, and start the loop.
    pub async fn start(
        room_client: &dyn RoomClient,
        room: RoomName,
        recorder_path: PathBuf,
        stack: Arc<dyn SipStack>,
        call: CallHandle,
        audio_dir: PathBuf,
    ) -> Result<Self> {
        let mut session = room_client
            .connect(&room, BRIDGE_IDENTITY)
            .await
            .map_err(SipError::Bridge)?;
        let publisher = session
            .publish_audio_track("caller-audio")
            .await
            .map_err(SipError::Bridge)?;
        let events = session
            .take_events()
            .ok_or_else(|| SipError::Media("bridge room has no event stream".into()))?;

        info!(room = %room, call, "audio bridge up");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge_loop(
            session,
            publisher,
            events,
            recorder_path,
            stack,
            call,
            audio_dir,
            cancel.clone(),
        ));
        Ok(Self { cancel, task })
    }

    /// Cancel the loop cooperatively; after the 2 s grace period the task is
    /// force-terminated. Teardown inside the loop observes
    /// unpublish → disconnect order.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("bridge loop exceeded grace period, aborting");
            task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn bridge_loop(
    mut session: Box<dyn RoomSession>,
    mut publisher: Box<dyn AudioPublisher>,
    mut events: mpsc::Receiver<RoomEvent>,
    recorder_path: PathBuf,
    stack: Arc<dyn SipStack>,
    call: CallHandle,
    audio_dir: PathBuf,
    cancel: CancellationToken,
) {
    let mut pos = WAV_HEADER_LEN;
    let mut out_buf: Vec<i16> = Vec::new();
    let mut last_flush = Instant::now();
    let mut clip_seq: u64 = 0;
    let mut interval = tokio::time::interval(BRIDGE_TICK);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Caller → operator: newly-appended recorder bytes.
        match read_new_bytes(&recorder_path, &mut pos) {
            Ok(bytes) if !bytes.is_empty() => {
                let pcm = pcm_from_le_bytes(&bytes);
                let up = upsample_linear(&pcm, TELEPHONY_RATE, WEBRTC_RATE);
                if publisher.write(&up).await.is_err() {
                    debug!("caller track write failed");
                }
            }
            Ok(_) => {}
            Err(e) => debug!("recorder tail read failed: {e}"),
        }

        // Operator → caller: drain the room, decimate, batch.
        let mut disconnected = false;
        while let Ok(event) = events.try_recv() {
            match event {
                RoomEvent::AudioFrame { samples, .. } => {
                    out_buf.extend(downsample_box(&samples, WEBRTC_RATE, TELEPHONY_RATE));
                }
                RoomEvent::Disconnected => disconnected = true,
                _ => {}
            }
        }

        let due = out_buf.len() >= OPERATOR_BATCH_SAMPLES
            || (!out_buf.is_empty() && last_flush.elapsed() >= OPERATOR_FLUSH_INTERVAL);
        if due {
            clip_seq += 1;
            let clip = std::mem::take(&mut out_buf);
            let path = audio_dir.join(format!("bridge-{call}-{clip_seq}.wav"));
            match write_wav(&path, &clip, TELEPHONY_RATE) {
                Ok(()) => {
                    if let Err(e) = stack.play_wav(call, &path).await {
                        warn!("operator clip playback failed: {e}");
                    }
                }
                Err(e) => warn!("operator clip write failed: {e}"),
            }
            last_flush = Instant::now();
        }

        if disconnected {
            debug!("bridge room disconnected");
            break;
        }
    }

    let _ = session.unpublish_all().await;
    let _ = session.disconnect().await;
    info!(call, "audio bridge down");
}

/// Read bytes appended past `pos`, advancing it. A missing file (recorder
/// not started yet) reads as empty.
fn read_new_bytes(path: &Path, pos: &mut u64) -> std::io::Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len <= *pos {
        return Ok(Vec::new());
    }
    // consume whole 16-bit samples only; a trailing odd byte waits for its pair
    let available = ((len - *pos) as usize).min(MAX_TAIL_BYTES) & !1;
    if available == 0 {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(*pos))?;
    let mut buf = vec![0u8; available];
    file.read_exact(&mut buf)?;
    *pos += available as u64;
    Ok(buf)
}
