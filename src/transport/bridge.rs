use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

/// Disconnector handed back to admission control so a superseded session
/// can be torn down from the outside; triggers the same teardown path as
/// a natural close/error.
pub type Disconnector = Arc<dyn Fn(u16, &str) + Send + Sync>;

struct TeardownGuard {
    done: AtomicBool,
    on_closed: Box<dyn Fn() + Send + Sync>,
}

impl TeardownGuard {
    fn fire_once(&self) {
        if self.done.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            (self.on_closed)();
        }
    }
}

/// Builds a WebSocket Close control frame (opcode 0x88), unmasked, with a
/// 2-byte status code followed by the reason. Caller must keep the reason
/// within 123 bytes so the payload fits the single-byte length encoding.
fn close_frame(code: u16, reason: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.push(0x88);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(&payload);
    frame
}

/// Bridges two already-accepted upgraded connections, relaying bytes in
/// both directions until either side closes or errors. Teardown runs
/// exactly once regardless of which side triggers it or whether an
/// external disconnector is invoked concurrently.
///
/// Returns a disconnector the caller can use to force-close the bridge
/// (e.g. when the identity-session manager replaces this connection).
pub fn spawn_bridge(
    client: Upgraded,
    upstream: Upgraded,
    on_closed: impl Fn() + Send + Sync + 'static,
) -> Disconnector {
    let guard = Arc::new(TeardownGuard {
        done: AtomicBool::new(false),
        on_closed: Box::new(on_closed),
    });
    let kill = Arc::new(Notify::new());
    let pending_close: Arc<Mutex<Option<(u16, Vec<u8>)>>> = Arc::new(Mutex::new(None));

    let mut client_io = TokioIo::new(client);
    let mut upstream_io = TokioIo::new(upstream);
    let guard_for_task = Arc::clone(&guard);
    let kill_for_task = Arc::clone(&kill);
    let pending_close_for_task = Arc::clone(&pending_close);

    crate::metrics::record_bridge_opened();

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io) => {
                match result {
                    Ok((client_to_upstream, upstream_to_client)) => {
                        crate::metrics::record_bridge_bytes(client_to_upstream, upstream_to_client);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "bridge relay ended with error");
                    }
                }
            }
            _ = kill_for_task.notified() => {
                tracing::debug!("bridge torn down by external disconnector");
                if let Some((code, reason)) = pending_close_for_task.lock().unwrap().take() {
                    let frame = close_frame(code, &reason);
                    let _ = client_io.write_all(&frame).await;
                    let _ = upstream_io.write_all(&frame).await;
                }
            }
        }
        let _ = client_io.into_inner().shutdown().await;
        let _ = upstream_io.into_inner().shutdown().await;
        guard_for_task.fire_once();
        crate::metrics::record_bridge_closed();
    });

    let guard_for_disconnector = Arc::clone(&guard);
    Arc::new(move |code, reason| {
        let code = crate::transport::sanitize_close_code(code);
        let reason_bytes = crate::transport::truncate_reason(reason).as_bytes().to_vec();
        tracing::debug!(code, reason, "bridge disconnector invoked");
        if !guard_for_disconnector.done.load(Ordering::Acquire) {
            *pending_close.lock().unwrap() = Some((code, reason_bytes));
            kill.notify_one();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_close_frame_layout() {
        let reason = b"Connection replaced by a newer session";
        let frame = close_frame(1008, reason);
        assert_eq!(frame[0], 0x88);
        assert_eq!(frame[1] as usize, 2 + reason.len());
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 1008);
        assert_eq!(&frame[4..], reason);
    }

    #[test]
    fn test_teardown_fires_once() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = Arc::clone(&count);
        let guard = TeardownGuard {
            done: AtomicBool::new(false),
            on_closed: Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        };
        guard.fire_once();
        guard.fire_once();
        guard.fire_once();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
