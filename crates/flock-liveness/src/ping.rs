//! Tri-state ping: ALIVE, DEAD or STUCK.
//!
//! ```text
//!   pid known? ──no──► DEAD
//!       │yes
//!   process exists? ──no──► DEAD
//!       │yes
//!   check endpoint (bounded) ──answer──► ALIVE
//!       └──timeout / no answer──► STUCK
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use flock_core::PingResult;
use tracing::debug;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// OS process lookup.
pub trait ProcessTable: Send + Sync {
    fn exists(&self, pid: u32) -> bool;
}

/// Process table backed by `kill(pid, 0)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessTable;

impl ProcessTable for OsProcessTable {
    #[cfg(unix)]
    fn exists(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs permission and existence checks only.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn exists(&self, _pid: u32) -> bool {
        false
    }
}

/// Liveness check against an isolate endpoint. `Err` carries the reason.
pub trait LivenessCheck: Send + Sync {
    fn check<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<(), String>>;
}

/// HTTP GET check; any response counts as an answer.
#[derive(Debug, Clone)]
pub struct HttpCheck {
    path: String,
}

impl HttpCheck {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

impl Default for HttpCheck {
    fn default() -> Self {
        Self::new("/liveness")
    }
}

impl LivenessCheck for HttpCheck {
    fn check<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let uri = format!("http://{endpoint}{}", self.path);
            let stream = tokio::net::TcpStream::connect(endpoint)
                .await
                .map_err(|e| format!("connect: {e}"))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| format!("handshake: {e}"))?;
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let request = http::Request::builder()
                .method("GET")
                .uri(&uri)
                .header("host", endpoint)
                .header("user-agent", "flock-liveness/0.1")
                .body(http_body_util::Empty::<bytes::Bytes>::new())
                .map_err(|e| format!("request: {e}"))?;
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| format!("send: {e}"))?;
            debug!(%uri, status = %response.status(), "liveness check answered");
            Ok(())
        })
    }
}

/// Bounded-time ping of one process.
#[derive(Clone)]
pub struct Pinger {
    processes: Arc<dyn ProcessTable>,
    check: Arc<dyn LivenessCheck>,
    timeout: Duration,
}

impl Pinger {
    pub fn new(
        processes: Arc<dyn ProcessTable>,
        check: Arc<dyn LivenessCheck>,
        timeout: Duration,
    ) -> Self {
        Self {
            processes,
            check,
            timeout,
        }
    }

    /// OS process table and HTTP check.
    pub fn system(timeout: Duration) -> Self {
        Self::new(Arc::new(OsProcessTable), Arc::new(HttpCheck::default()), timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ping process `pid`, probing `endpoint` when the isolate has one.
    pub async fn ping(&self, pid: Option<u32>, endpoint: Option<&str>) -> PingResult {
        let Some(pid) = pid else {
            return PingResult::Dead;
        };
        if !self.processes.exists(pid) {
            debug!(pid, "process not found");
            return PingResult::Dead;
        }
        let Some(endpoint) = endpoint else {
            return PingResult::Alive;
        };
        match tokio::time::timeout(self.timeout, self.check.check(endpoint)).await {
            Ok(Ok(())) => PingResult::Alive,
            Ok(Err(reason)) => {
                debug!(pid, %endpoint, %reason, "process exists but does not answer");
                PingResult::Stuck
            }
            Err(_) => {
                debug!(pid, %endpoint, timeout = ?self.timeout, "liveness check timed out");
                PingResult::Stuck
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FakeProcesses(HashSet<u32>);

    impl ProcessTable for FakeProcesses {
        fn exists(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }
    }

    struct DelayedCheck(Duration);

    impl LivenessCheck for DelayedCheck {
        fn check<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<(), String>> {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                Ok(())
            })
        }
    }

    fn pinger(delay: Duration) -> Pinger {
        Pinger::new(
            Arc::new(FakeProcesses([42].into_iter().collect())),
            Arc::new(DelayedCheck(delay)),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn tri_state() {
        assert_eq!(pinger(Duration::ZERO).ping(Some(7), Some("x")).await, PingResult::Dead);
        assert_eq!(pinger(Duration::ZERO).ping(None, Some("x")).await, PingResult::Dead);
        assert_eq!(pinger(Duration::ZERO).ping(Some(42), Some("x")).await, PingResult::Alive);
        assert_eq!(
            pinger(Duration::from_secs(5)).ping(Some(42), Some("x")).await,
            PingResult::Stuck
        );
        assert_eq!(pinger(Duration::from_secs(5)).ping(Some(42), None).await, PingResult::Alive);
    }

    #[cfg(unix)]
    #[test]
    fn os_process_table_sees_current_process() {
        assert!(OsProcessTable.exists(std::process::id()));
        assert!(!OsProcessTable.exists(0));
        assert!(!OsProcessTable.exists(u32::MAX));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn http_check_answers_and_hangs() {
        let answering = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let answering_addr = answering.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = answering.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_socket, _) = silent.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let pinger = Pinger::new(
            Arc::new(OsProcessTable),
            Arc::new(HttpCheck::default()),
            Duration::from_millis(300),
        );
        let pid = Some(std::process::id());
        assert_eq!(pinger.ping(pid, Some(&answering_addr)).await, PingResult::Alive);
        assert_eq!(pinger.ping(pid, Some(&silent_addr)).await, PingResult::Stuck);
    }
}
