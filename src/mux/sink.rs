//! MPEG-TS output sink with TCP fanout
//!
//! Encoded packets are muxed to MPEG-TS once and the byte stream is fanned
//! out to every connected client. Client sockets are non-blocking: a write
//! that would block drops the remainder for that client and counts the bytes;
//! a client that keeps failing is closed and removed. The mux thread is never
//! the one waiting.

use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{info, warn};
use socket2::{SockRef, TcpKeepalive};

use ac_ffmpeg::codec::CodecParameters;
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::muxer::{Muxer, OutputFormat};
use ac_ffmpeg::packet::Packet;

use crate::metrics::ChannelMetrics;

/// Consecutive failed writes before a client is dropped.
const MAX_CLIENT_FAILURES: u8 = 8;

struct ClientEntry {
    stream: TcpStream,
    error_count: u8,
}

#[derive(Default)]
struct FanoutShared {
    clients: Mutex<Vec<ClientEntry>>,
    client_count: AtomicUsize,
    bytes_dropped: AtomicU64,
    closed: AtomicBool,
}

/// `Write` half handed to the muxer. Fans every buffer out to all clients;
/// always reports success so muxing never stalls on a slow receiver.
struct FanoutWriter {
    shared: Arc<FanoutShared>,
    metrics: Arc<ChannelMetrics>,
}

impl FanoutWriter {
    fn drop_bytes(&self, n: u64) {
        self.shared.bytes_dropped.fetch_add(n, Ordering::Relaxed);
        self.metrics.record_bytes_dropped(n);
    }
}

impl Write for FanoutWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut clients = self.shared.clients.lock().unwrap();
        let mut i = 0;
        while i < clients.len() {
            let entry = &mut clients[i];
            match entry.stream.write(buf) {
                Ok(n) => {
                    entry.error_count = 0;
                    if n < buf.len() {
                        // Partial write: drop the remainder, never retry
                        self.drop_bytes((buf.len() - n) as u64);
                    }
                    i += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.drop_bytes(buf.len() as u64);
                    entry.error_count += 1;
                    if entry.error_count >= MAX_CLIENT_FAILURES {
                        warn!("TsFanoutSink: client stalled, dropping");
                        clients.remove(i);
                    } else {
                        i += 1;
                    }
                }
                Err(_) => {
                    info!("TsFanoutSink: client disconnected");
                    clients.remove(i);
                }
            }
        }
        self.shared
            .client_count
            .store(clients.len(), Ordering::Relaxed);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The per-channel TS sink: one muxer, any number of receivers.
pub struct TsFanoutSink {
    muxer: Muxer<FanoutWriter>,
    shared: Arc<FanoutShared>,
    video_index: usize,
    audio_index: usize,
}

impl TsFanoutSink {
    /// Bind the fanout listener and set up the MPEG-TS muxer with a video
    /// and an audio stream.
    pub fn bind(
        port: u16,
        video_params: CodecParameters,
        audio_params: CodecParameters,
        metrics: Arc<ChannelMetrics>,
    ) -> Result<Self> {
        let shared = Arc::new(FanoutShared::default());

        let listener = TcpListener::bind(("0.0.0.0", port))?;
        info!("TsFanoutSink: listening on {}", listener.local_addr()?);
        spawn_accept_loop(listener, Arc::clone(&shared));

        let output_format =
            OutputFormat::find("mpegts").ok_or_else(|| anyhow!("mpegts muxer unavailable"))?;
        let io = IO::from_write_stream(FanoutWriter {
            shared: Arc::clone(&shared),
            metrics,
        });

        let mut builder = Muxer::builder();
        builder.add_stream(&video_params)?;
        builder.add_stream(&audio_params)?;
        let muxer = builder.build(io, output_format)?;

        Ok(Self {
            muxer,
            shared,
            video_index: 0,
            audio_index: 1,
        })
    }

    pub fn write_video(&mut self, packet: Packet) -> Result<()> {
        self.muxer
            .push(packet.with_stream_index(self.video_index))?;
        Ok(())
    }

    pub fn write_audio(&mut self, packet: Packet) -> Result<()> {
        self.muxer
            .push(packet.with_stream_index(self.audio_index))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.muxer.flush()?;
        Ok(())
    }

    pub fn bytes_dropped(&self) -> u64 {
        self.shared.bytes_dropped.load(Ordering::Relaxed)
    }

    pub fn client_count(&self) -> usize {
        self.shared.client_count.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.clients.lock().unwrap().clear();
        self.shared.client_count.store(0, Ordering::Relaxed);
    }
}

impl Drop for TsFanoutSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accept receivers until the sink closes. Each client socket goes
/// non-blocking with keepalive before it joins the fanout list.
fn spawn_accept_loop(listener: TcpListener, shared: Arc<FanoutShared>) {
    listener
        .set_nonblocking(true)
        .expect("listener nonblocking");
    std::thread::Builder::new()
        .name("ts-sink-accept".into())
        .spawn(move || {
            loop {
                if shared.closed.load(Ordering::Acquire) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, addr)) => {
                        info!("TsFanoutSink: receiver connected from {}", addr);
                        if let Err(e) = prepare_client(&stream) {
                            warn!("TsFanoutSink: client setup failed: {}", e);
                            continue;
                        }
                        let mut clients = shared.clients.lock().unwrap();
                        clients.push(ClientEntry {
                            stream,
                            error_count: 0,
                        });
                        shared.client_count.store(clients.len(), Ordering::Relaxed);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        warn!("TsFanoutSink: accept error: {}", e);
                        std::thread::sleep(Duration::from_millis(200));
                    }
                }
            }
        })
        .expect("spawn accept loop");
}

fn prepare_client(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    let keep_alive = TcpKeepalive::new()
        .with_time(Duration::from_secs(20))
        .with_interval(Duration::from_secs(20));
    sock.set_tcp_keepalive(&keep_alive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn writer_with_client() -> (FanoutWriter, TcpStream, Arc<FanoutShared>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        let shared = Arc::new(FanoutShared::default());
        shared.clients.lock().unwrap().push(ClientEntry {
            stream: server_side,
            error_count: 0,
        });
        shared.client_count.store(1, Ordering::Relaxed);
        (
            FanoutWriter {
                shared: Arc::clone(&shared),
                metrics: Arc::new(ChannelMetrics::new()),
            },
            client,
            shared,
        )
    }

    #[test]
    fn test_fanout_delivers_bytes() {
        let (mut writer, mut client, _shared) = writer_with_client();
        assert_eq!(writer.write(b"abcd").unwrap(), 4);

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_write_never_blocks_and_drops_on_backpressure() {
        let (mut writer, client, shared) = writer_with_client();

        // Never read from `client`: the kernel buffers fill up and the
        // non-blocking write starts failing with WouldBlock.
        let chunk = vec![0u8; 64 * 1024];
        for _ in 0..256 {
            // Writer must report success regardless
            assert_eq!(writer.write(&chunk).unwrap(), chunk.len());
        }
        assert!(shared.bytes_dropped.load(Ordering::Relaxed) > 0);
        drop(client);
    }

    #[test]
    fn test_disconnected_client_removed() {
        let (mut writer, client, shared) = writer_with_client();
        drop(client);
        // A couple of writes flush out the dead connection
        for _ in 0..4 {
            let _ = writer.write(b"xxxx");
        }
        assert_eq!(shared.clients.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_write_with_no_clients_succeeds() {
        let shared = Arc::new(FanoutShared::default());
        let mut writer = FanoutWriter {
            shared: Arc::clone(&shared),
            metrics: Arc::new(ChannelMetrics::new()),
        };
        assert_eq!(writer.write(b"data").unwrap(), 4);
        assert_eq!(shared.bytes_dropped.load(Ordering::Relaxed), 0);
    }
}
