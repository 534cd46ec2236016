//! Stellarium telescope server simulating a mount
//!
//! Every connected client receives the simulated position at a fixed
//! interval and may send goto frames; the mount creeps towards the latest
//! target the same way the virtual telescope does.

use crate::clock::{Clock, SystemClock};
use crate::codec::stellarium::{decode_goto, encode_position, split_frames, BUFFER_CAPACITY, MSG_TYPE_POSITION};
use crate::connection::default_position;
use crate::coordinates::{rect_to_spherical, spherical_to_rect};
use crate::virtual_telescope::slew_step;
use nalgebra::Vector3;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Simulated mount shared by all clients
#[derive(Debug, Clone, PartialEq)]
pub struct DummyMount {
    pub position: Vector3<f64>,
    pub target: Vector3<f64>,
}

impl Default for DummyMount {
    fn default() -> Self {
        Self {
            position: default_position(),
            target: default_position(),
        }
    }
}

impl DummyMount {
    pub fn step(&mut self) {
        self.position = slew_step(&self.position, &self.target);
    }
}

pub struct DummyServer {
    listener: TcpListener,
    mount: Arc<Mutex<DummyMount>>,
    update_interval: Duration,
}

impl DummyServer {
    pub async fn bind(addr: &str, update_interval: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Dummy telescope server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            mount: Arc::new(Mutex::new(DummyMount::default())),
            update_interval,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn mount(&self) -> Arc<Mutex<DummyMount>> {
        self.mount.clone()
    }

    /// Serve clients until accepting fails
    pub async fn run(self) -> io::Result<()> {
        let mount = self.mount.clone();
        let update_interval = self.update_interval;
        let simulation = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(update_interval);
            loop {
                ticker.tick().await;
                mount.lock().await.step();
            }
        });

        let result = loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e),
            };
            tracing::info!("New client: {}", peer);
            let mount = self.mount.clone();
            tokio::spawn(async move {
                match serve_client(stream, mount, update_interval).await {
                    Ok(()) => tracing::info!("Client {} disconnected", peer),
                    Err(e) => tracing::warn!("Client {} dropped: {}", peer, e),
                }
            });
        };
        simulation.abort();
        result
    }
}

async fn serve_client(
    stream: TcpStream,
    mount: Arc<Mutex<DummyMount>>,
    update_interval: Duration,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let mut ticker = tokio::time::interval(update_interval);
    let mut pending = Vec::with_capacity(BUFFER_CAPACITY);
    let mut chunk = [0u8; BUFFER_CAPACITY];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let position = mount.lock().await.position;
                let (ra, dec) = rect_to_spherical(&position);
                writer
                    .write_all(&encode_position(SystemClock.now_micros(), ra, dec, 0))
                    .await?;
            }
            read = reader.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                pending.extend_from_slice(&chunk[..n]);
                let frames = split_frames(&mut pending, BUFFER_CAPACITY)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                for (msg_type, frame) in frames {
                    if msg_type != MSG_TYPE_POSITION {
                        continue;
                    }
                    let goto = decode_goto(&frame)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    tracing::info!("Goto ra={:.6} dec={:.6}", goto.ra, goto.dec);
                    mount.lock().await.target = spherical_to_rect(goto.ra, goto.dec);
                }
            }
        }
    }
}
