//! Remote PTY manager — the host-side owner of terminal processes.
//!
//! Decoupled from the transport through two callbacks supplied at
//! construction: every byte read from a PTY goes to the output callback as
//! `(session_id, mobile_id, bytes)`, and child exit fires the exit callback
//! exactly once. The enclosing host runtime turns those into
//! `terminal_output` / `session_close` relay messages.
//!
//! The session table is the only shared structure. It is mutated by the
//! operations below and by the exit path; the per-session reader threads
//! never touch it otherwise.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// `(session_id, mobile_id, bytes)` — raw PTY output, unbuffered and
/// unmodified. Must not block: it runs on the session's reader thread.
pub type OutputCallback = Arc<dyn Fn(&str, &str, &[u8]) + Send + Sync>;

/// `(session_id, mobile_id)` — the child process exited on its own.
pub type ExitCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Identity of a session being created, as relayed from the mobile.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub session_id: String,
    pub mobile_id: String,
}

struct RemoteSession {
    mobile_id: String,
    working_directory: String,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

type SessionTable = Arc<Mutex<HashMap<String, RemoteSession>>>;

pub struct RemotePtyManager {
    sessions: SessionTable,
    on_output: OutputCallback,
    on_exit: ExitCallback,
}

impl RemotePtyManager {
    pub fn new(on_output: OutputCallback, on_exit: ExitCallback) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            on_output,
            on_exit,
        }
    }

    /// Spawn a PTY-backed shell for a session. Returns `false` if the
    /// session id is already taken or the OS refuses to spawn.
    pub fn create_session(
        &self,
        spec: SessionSpec,
        cwd: &str,
        shell: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> bool {
        if lock(&self.sessions).contains_key(&spec.session_id) {
            warn!(session_id = %spec.session_id, "session id already exists");
            return false;
        }

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = match native_pty_system().openpty(size) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(err = %e, "openpty failed");
                return false;
            }
        };

        let shell = shell.map(str::to_string).unwrap_or_else(default_shell);
        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");

        let child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(e) => {
                warn!(shell = %shell, err = %e, "failed to spawn shell");
                return false;
            }
        };
        // The child holds its own slave handle now.
        drop(pair.slave);

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                warn!(err = %e, "failed to clone pty reader");
                return false;
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                warn!(err = %e, "failed to take pty writer");
                return false;
            }
        };

        info!(
            session_id = %spec.session_id,
            mobile_id = %spec.mobile_id,
            shell = %shell,
            cwd = %cwd,
            "remote session started"
        );
        lock(&self.sessions).insert(
            spec.session_id.clone(),
            RemoteSession {
                mobile_id: spec.mobile_id.clone(),
                working_directory: cwd.to_string(),
                master: pair.master,
                writer,
                child,
            },
        );

        self.spawn_reader(spec, reader);
        true
    }

    /// One blocking reader thread per session, single producer for that
    /// session's output ordering.
    fn spawn_reader(&self, spec: SessionSpec, mut reader: Box<dyn Read + Send>) {
        let sessions = Arc::clone(&self.sessions);
        let on_output = Arc::clone(&self.on_output);
        let on_exit = Arc::clone(&self.on_exit);

        let builder = std::thread::Builder::new().name(format!("pty-{}", spec.session_id));
        let spawned = builder.spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => (on_output)(&spec.session_id, &spec.mobile_id, &buf[..n]),
                }
            }
            // EOF or read error: the child is gone. If the record is still
            // present the exit was spontaneous — reap it and fire the exit
            // callback once. close_session removes the record first, so an
            // operator-initiated close never double-reports.
            let removed = lock(&sessions).remove(&spec.session_id);
            if let Some(mut session) = removed {
                let _ = session.child.wait();
                debug!(session_id = %spec.session_id, "remote session exited");
                (on_exit)(&spec.session_id, &spec.mobile_id);
            }
        });
        if let Err(e) = spawned {
            warn!(err = %e, "failed to spawn pty reader thread");
        }
    }

    /// Write raw bytes to the session's PTY input. No interpretation.
    pub fn write(&self, session_id: &str, data: &[u8]) -> bool {
        let mut sessions = lock(&self.sessions);
        match sessions.get_mut(session_id) {
            Some(session) => session.writer.write_all(data).is_ok(),
            None => false,
        }
    }

    /// Update the PTY window size.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        let sessions = lock(&self.sessions);
        match sessions.get(session_id) {
            Some(session) => session
                .master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Terminate a session's child and drop the record. Idempotent:
    /// returns `false` for an unknown session.
    pub fn close_session(&self, session_id: &str) -> bool {
        let removed = lock(&self.sessions).remove(session_id);
        match removed {
            Some(session) => {
                terminate(session_id, session);
                true
            }
            None => false,
        }
    }

    /// Close every session owned by a mobile. Returns how many were closed.
    pub fn close_sessions_for_mobile(&self, mobile_id: &str) -> usize {
        let drained: Vec<(String, RemoteSession)> = {
            let mut sessions = lock(&self.sessions);
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.mobile_id == mobile_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
                .collect()
        };
        let count = drained.len();
        for (id, session) in drained {
            terminate(&id, session);
        }
        if count > 0 {
            info!(mobile_id = %mobile_id, count, "closed sessions for disconnected mobile");
        }
        count
    }

    /// Teardown on host shutdown.
    pub fn close_all(&self) {
        let drained: Vec<(String, RemoteSession)> = lock(&self.sessions).drain().collect();
        for (id, session) in drained {
            terminate(&id, session);
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// The working directory a session was started in, if it is live.
    pub fn working_directory(&self, session_id: &str) -> Option<String> {
        lock(&self.sessions)
            .get(session_id)
            .map(|s| s.working_directory.clone())
    }
}

/// Kill and reap one already-removed session. The record is gone from the
/// table before this runs, so the reader thread's exit path stays silent.
fn terminate(session_id: &str, mut session: RemoteSession) {
    if let Err(e) = session.child.kill() {
        debug!(session_id, err = %e, "kill failed — child likely already exited");
    }
    let _ = session.child.wait();
    info!(session_id, "remote session closed");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn default_shell() -> String {
    #[cfg(unix)]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
    #[cfg(windows)]
    {
        "cmd.exe".to_string()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn manager() -> (
        RemotePtyManager,
        mpsc::Receiver<(String, String, Vec<u8>)>,
        mpsc::Receiver<(String, String)>,
    ) {
        let (out_tx, out_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let manager = RemotePtyManager::new(
            Arc::new(move |sid: &str, mid: &str, bytes: &[u8]| {
                let _ = out_tx.send((sid.to_string(), mid.to_string(), bytes.to_vec()));
            }),
            Arc::new(move |sid: &str, mid: &str| {
                let _ = exit_tx.send((sid.to_string(), mid.to_string()));
            }),
        );
        (manager, out_rx, exit_rx)
    }

    fn spec(session_id: &str, mobile_id: &str) -> SessionSpec {
        SessionSpec {
            session_id: session_id.to_string(),
            mobile_id: mobile_id.to_string(),
        }
    }

    #[test]
    fn unknown_session_operations_return_false() {
        let (manager, _out, _exit) = manager();
        assert!(!manager.write("missing", b"x"));
        assert!(!manager.resize("missing", 80, 24));
        assert!(!manager.close_session("missing"));
        assert_eq!(manager.close_sessions_for_mobile("nobody"), 0);
    }

    #[test]
    fn spawn_failure_returns_false() {
        let (manager, _out, _exit) = manager();
        assert!(!manager.create_session(
            spec("s1", "m1"),
            "/",
            Some("/definitely-not-a-shell"),
            80,
            24,
        ));
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn duplicate_session_id_is_rejected() {
        let (manager, _out, _exit) = manager();
        assert!(manager.create_session(spec("s1", "m1"), "/", Some("/bin/sh"), 80, 24));
        assert!(!manager.create_session(spec("s1", "m1"), "/", Some("/bin/sh"), 80, 24));
        assert_eq!(manager.session_count(), 1);
        manager.close_all();
    }

    #[test]
    fn output_flows_and_exit_fires_once() {
        let (manager, out_rx, exit_rx) = manager();
        assert!(manager.create_session(spec("s1", "m1"), "/", Some("/bin/sh"), 80, 24));

        // An interactive shell on a fresh PTY prints something (a prompt at
        // minimum) fairly quickly.
        let (sid, mid, _bytes) = out_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("pty output");
        assert_eq!(sid, "s1");
        assert_eq!(mid, "m1");

        assert!(manager.write("s1", b"exit\n"));
        let (sid, mid) = exit_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("exit callback");
        assert_eq!((sid.as_str(), mid.as_str()), ("s1", "m1"));
        assert_eq!(manager.session_count(), 0);

        // Exactly once.
        assert!(exit_rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn resize_live_session() {
        let (manager, _out, _exit) = manager();
        assert!(manager.create_session(spec("s1", "m1"), "/", Some("/bin/sh"), 80, 24));
        assert!(manager.resize("s1", 132, 43));
        manager.close_all();
    }

    #[test]
    fn explicit_close_suppresses_exit_callback() {
        let (manager, _out, exit_rx) = manager();
        assert!(manager.create_session(spec("s1", "m1"), "/", Some("/bin/sh"), 80, 24));
        assert!(manager.close_session("s1"));
        assert!(!manager.close_session("s1"));
        // The reader thread sees EOF but the record is already gone.
        assert!(exit_rx.recv_timeout(Duration::from_secs(2)).is_err());
    }

    #[test]
    fn close_sessions_for_mobile_only_touches_that_mobile() {
        let (manager, _out, _exit) = manager();
        assert!(manager.create_session(spec("s1", "m1"), "/", Some("/bin/sh"), 80, 24));
        assert!(manager.create_session(spec("s2", "m2"), "/", Some("/bin/sh"), 80, 24));

        assert_eq!(manager.close_sessions_for_mobile("m1"), 1);
        assert_eq!(manager.session_count(), 1);
        assert!(manager.working_directory("s2").is_some());
        manager.close_all();
        assert_eq!(manager.session_count(), 0);
    }
}
