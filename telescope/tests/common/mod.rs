//! Helpers shared by the integration tests

#![allow(dead_code)]

use scopelink::clock::{Clock, SystemClock};
use scopelink::codec::stellarium::{
    decode_goto, encode_position, split_frames, GotoMessage, BUFFER_CAPACITY, MSG_TYPE_POSITION,
};
use scopelink::{ConnectionProfile, ControlConfig, Equinox, Interface, TelescopeControl};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn control() -> TelescopeControl {
    TelescopeControl::new(ControlConfig::default()).expect("runtime")
}

pub fn tcp_profile(name: &str, port: u16, equinox: Equinox) -> ConnectionProfile {
    let mut profile = ConnectionProfile::new(
        name,
        Interface::StellariumTcp {
            host: "127.0.0.1".to_string(),
            tcp_port: port,
        },
    );
    profile.equinox = equinox;
    profile.connect_delay_micros = 1;
    profile
}

/// Tick until `done` holds or the timeout passes
pub fn tick_until(
    control: &mut TelescopeControl,
    timeout: Duration,
    mut done: impl FnMut(&TelescopeControl) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        control.tick(5_000);
        if done(control) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

enum Command {
    Send(Vec<u8>),
    Report { ra: f64, dec: f64 },
}

/// Stellarium server on a thread: reports a fixed position every 20 ms and
/// forwards the gotos it receives
pub struct ScriptedServer {
    pub port: u16,
    commands: mpsc::Sender<Command>,
    gotos: mpsc::Receiver<GotoMessage>,
}

impl ScriptedServer {
    pub fn start(ra: f64, dec: f64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let (command_tx, command_rx) = mpsc::channel();
        let (goto_tx, goto_rx) = mpsc::channel();

        thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            stream
                .set_read_timeout(Some(Duration::from_millis(10)))
                .expect("read timeout");
            let (mut ra, mut dec) = (ra, dec);
            let mut pending = Vec::new();
            let mut chunk = [0u8; 256];
            let mut last_report = Instant::now() - Duration::from_secs(1);
            loop {
                match command_rx.try_recv() {
                    Ok(Command::Send(bytes)) => {
                        if stream.write_all(&bytes).is_err() {
                            return;
                        }
                    }
                    Ok(Command::Report { ra: r, dec: d }) => {
                        ra = r;
                        dec = d;
                    }
                    Err(mpsc::TryRecvError::Disconnected) => return,
                    Err(mpsc::TryRecvError::Empty) => {}
                }
                if last_report.elapsed() >= Duration::from_millis(20) {
                    last_report = Instant::now();
                    let frame = encode_position(SystemClock.now_micros(), ra, dec, 0);
                    if stream.write_all(&frame).is_err() {
                        return;
                    }
                }
                match stream.read(&mut chunk) {
                    Ok(0) => return,
                    Ok(n) => {
                        pending.extend_from_slice(&chunk[..n]);
                        let Ok(frames) = split_frames(&mut pending, BUFFER_CAPACITY) else {
                            return;
                        };
                        for (msg_type, frame) in frames {
                            if msg_type == MSG_TYPE_POSITION {
                                if let Ok(goto) = decode_goto(&frame) {
                                    let _ = goto_tx.send(goto);
                                }
                            }
                        }
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    Err(_) => return,
                }
            }
        });

        Self {
            port,
            commands: command_tx,
            gotos: goto_rx,
        }
    }

    /// Write raw bytes to the client
    pub fn send(&self, bytes: &[u8]) {
        let _ = self.commands.send(Command::Send(bytes.to_vec()));
    }

    /// Change the reported position
    pub fn report(&self, ra: f64, dec: f64) {
        let _ = self.commands.send(Command::Report { ra, dec });
    }

    /// Gotos received so far
    pub fn received_gotos(&self) -> Vec<GotoMessage> {
        self.gotos.try_iter().collect()
    }
}
