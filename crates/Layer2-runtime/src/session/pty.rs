//! PTY-backed shell connector
//!
//! Spawns `ssh -tt` when the project has SSH parameters, otherwise
//! `docker exec -it <container> <shell>`, under a native pseudo-terminal.

use super::shell::{ShellConnector, ShellControl, ShellEvent, ShellHandle, TermSize};
use crate::project::ProjectTarget;
use async_trait::async_trait;
use devyard_foundation::{ContainerRuntime, Error, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long a freshly spawned client gets to fail before it counts as connected
const SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Exit status poll window after the PTY reports EOF
const EXIT_POLL_ATTEMPTS: usize = 50;

/// errno a PTY master reads once the child side hangs up
#[cfg(unix)]
const EIO: i32 = 5;

pub struct PtyShellConnector {
    runtime: ContainerRuntime,
    shell: String,
}

impl PtyShellConnector {
    pub fn new(runtime: ContainerRuntime, shell: impl Into<String>) -> Self {
        Self {
            runtime,
            shell: shell.into(),
        }
    }

    /// Program and arguments for reaching `target`
    pub fn command_line(&self, target: &ProjectTarget) -> (String, Vec<String>) {
        match &target.ssh {
            Some(ssh) => {
                let mut args = vec![
                    "-tt".to_string(),
                    "-p".to_string(),
                    ssh.port.to_string(),
                    "-o".to_string(),
                    "StrictHostKeyChecking=accept-new".to_string(),
                    "-o".to_string(),
                    "ServerAliveInterval=30".to_string(),
                ];
                if let Some(identity) = &ssh.identity_file {
                    args.push("-i".to_string());
                    args.push(identity.display().to_string());
                }
                args.push(format!("{}@{}", ssh.user, ssh.host));
                ("ssh".to_string(), args)
            }
            None => {
                let mut args = vec!["exec".to_string(), "-it".to_string()];
                if let Some(workdir) = &target.workdir {
                    args.push("-w".to_string());
                    args.push(workdir.clone());
                }
                args.push(target.container.clone());
                args.push(self.shell.clone());
                (self.runtime.command().to_string(), args)
            }
        }
    }
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[async_trait]
impl ShellConnector for PtyShellConnector {
    async fn connect(&self, target: &ProjectTarget, size: TermSize) -> Result<ShellHandle> {
        let (program, args) = self.command_line(target);
        info!(key = %target.key, program = %program, "Opening shell");

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| Error::Connection(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&args);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Connection(format!("Failed to spawn {}: {}", program, e)))?;
        // Only the master side is needed from here on
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Connection(format!("Failed to clone PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Connection(format!("Failed to take PTY writer: {}", e)))?;

        let (input, input_rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || write_loop(writer, input_rx));

        let control = Arc::new(PtyControl {
            input: Mutex::new(Some(input)),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            closed: AtomicBool::new(false),
        });

        // A client that cannot reach its target exits almost immediately
        tokio::time::sleep(SETTLE_DELAY).await;
        if let Some(code) = control.try_exit_code() {
            control.close();
            return Err(Error::Connection(format!(
                "{} exited during connect with code {}",
                program, code
            )));
        }

        let (tx, rx) = mpsc::channel::<ShellEvent>(256);
        let reader_control = Arc::clone(&control);
        tokio::task::spawn_blocking(move || read_loop(reader, reader_control, tx));

        Ok(ShellHandle {
            events: rx,
            control,
        })
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, control: Arc<PtyControl>, tx: mpsc::Sender<ShellEvent>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(ShellEvent::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if is_hangup(&e) => break,
            Err(e) => {
                let _ = tx.blocking_send(ShellEvent::Error(format!("PTY read failed: {}", e)));
                return;
            }
        }
    }

    let mut code = None;
    for _ in 0..EXIT_POLL_ATTEMPTS {
        code = control.try_exit_code();
        if code.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    debug!(code = ?code, "PTY reader finished");
    let _ = tx.blocking_send(ShellEvent::Exit(code));
}

fn is_hangup(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(EIO) {
        return true;
    }
    e.kind() == std::io::ErrorKind::BrokenPipe
}

/// Drain queued input into the PTY off the async workers
fn write_loop<W: Write>(mut writer: W, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            warn!(error = %e, "PTY write failed");
            return;
        }
    }
    debug!("PTY writer finished");
}

struct PtyControl {
    input: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    closed: AtomicBool,
}

impl PtyControl {
    fn try_exit_code(&self) -> Option<i32> {
        match self.child.lock().try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            _ => None,
        }
    }
}

impl ShellControl for PtyControl {
    fn write(&self, data: &[u8]) -> Result<()> {
        let input = self.input.lock();
        let sent = match input.as_ref() {
            Some(input) => input.send(data.to_vec()).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            Err(Error::Connection("PTY writer closed".to_string()))
        }
    }

    fn resize(&self, size: TermSize) -> Result<()> {
        self.master
            .lock()
            .resize(pty_size(size))
            .map_err(|e| Error::Connection(format!("PTY resize failed: {}", e)))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.input.lock().take();
        if let Err(e) = self.child.lock().kill() {
            warn!(error = %e, "Failed to kill shell process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::SshTarget;
    use std::path::PathBuf;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_drains_queue_in_order() {
        let buf = SharedBuf::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = buf.clone();
        let writer = std::thread::spawn(move || write_loop(sink, rx));

        tx.send(b"ls ".to_vec()).unwrap();
        tx.send(b"-la\n".to_vec()).unwrap();
        drop(tx);
        writer.join().unwrap();

        assert_eq!(buf.0.lock().as_slice(), b"ls -la\n");
    }

    #[test]
    fn test_writer_stops_on_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = std::thread::spawn(move || write_loop(BrokenWriter, rx));

        tx.send(b"x".to_vec()).unwrap();
        writer.join().unwrap();

        // Receiver is gone, so later input is refused instead of queued forever
        assert!(tx.send(b"y".to_vec()).is_err());
    }

    #[test]
    fn test_hangup_detection() {
        #[cfg(unix)]
        assert!(is_hangup(&std::io::Error::from_raw_os_error(EIO)));
        assert!(is_hangup(&std::io::ErrorKind::BrokenPipe.into()));
        assert!(!is_hangup(&std::io::ErrorKind::PermissionDenied.into()));
    }

    #[test]
    fn test_exec_command_line() {
        let connector = PtyShellConnector::new(ContainerRuntime::Podman, "zsh");
        let mut target = ProjectTarget::new("web", "web-dev");
        target.workdir = Some("/workspace".into());

        let (program, args) = connector.command_line(&target);
        assert_eq!(program, "podman");
        assert_eq!(args, vec!["exec", "-it", "-w", "/workspace", "web-dev", "zsh"]);
    }

    #[test]
    fn test_ssh_command_line() {
        let connector = PtyShellConnector::new(ContainerRuntime::Docker, "bash");
        let mut target = ProjectTarget::new("web", "web-dev");
        target.ssh = Some(SshTarget {
            host: "127.0.0.1".into(),
            port: 2201,
            user: "dev".into(),
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
        });

        let (program, args) = connector.command_line(&target);
        assert_eq!(program, "ssh");
        assert_eq!(args.first().map(String::as_str), Some("-tt"));
        assert!(args.windows(2).any(|w| w == ["-p", "2201"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id_ed25519"]));
        assert_eq!(args.last().map(String::as_str), Some("dev@127.0.0.1"));
    }
}
