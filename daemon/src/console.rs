/// Console command listener.
///
/// Reads stdin on a dedicated thread, since a blocking read cannot be
/// cancelled and would otherwise hold up runtime shutdown. Each non-empty
/// line is parsed into a [`Command`] and forwarded as
/// [`LauncherEvent::Command`]; unparsable lines are answered with the help
/// text. End of input is forwarded as [`LauncherEvent::Shutdown`].
use std::io::{self, BufRead};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::warn;

use crate::event::{Command, LauncherEvent, HELP};

pub fn start(tx: mpsc::Sender<LauncherEvent>) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("console-input".into())
        .spawn(move || forward_commands(io::stdin().lock(), &tx))
}

/// Blocks until `input` ends or the receiver is gone.
fn forward_commands<R: BufRead>(input: R, tx: &mpsc::Sender<LauncherEvent>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read console input: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(command) => {
                if tx.blocking_send(LauncherEvent::Command(command)).is_err() {
                    return;
                }
            }
            Err(e) => println!("{e}\n{HELP}"),
        }
    }
    let _ = tx.blocking_send(LauncherEvent::Shutdown);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn drain(rx: &mut mpsc::Receiver<LauncherEvent>) -> Vec<LauncherEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn forwards_commands_then_shutdown() {
        let (tx, mut rx) = mpsc::channel(8);
        forward_commands(Cursor::new("start\n\n  \nbogus\ncompanion on\n"), &tx);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], LauncherEvent::Command(Command::Start)));
        assert!(matches!(events[1], LauncherEvent::Command(Command::Companion(true))));
        assert!(matches!(events[2], LauncherEvent::Shutdown));
    }

    #[test]
    fn stops_when_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        // Must return rather than block or panic.
        forward_commands(Cursor::new("start\nstop\n"), &tx);
    }
}
