//! In-process MODBUS/TCP server used by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use plc_link::EndpointConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function: u8,
    pub address: u16,
}

struct PlcMemory {
    registers: Vec<u16>,
    coils: Vec<bool>,
    /// Response delay keyed by request start address.
    delays: HashMap<u16, Duration>,
    /// Exception code keyed by request start address.
    exceptions: HashMap<u16, u8>,
    seen: Vec<SeenRequest>,
    /// Write responses one byte at a time.
    trickle: bool,
}

pub struct FakePlc {
    addr: SocketAddr,
    memory: Arc<Mutex<PlcMemory>>,
    accepted: Arc<AtomicUsize>,
    accept_times: Arc<Mutex<Vec<Instant>>>,
    kill: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl FakePlc {
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Listens on a fixed port, e.g. to bring a stopped server back.
    pub async fn start_on(port: u16) -> Self {
        let mut bind = TcpListener::bind(("127.0.0.1", port)).await;
        for _ in 0..20 {
            if bind.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            bind = TcpListener::bind(("127.0.0.1", port)).await;
        }
        let listener = bind.unwrap();
        let addr = listener.local_addr().unwrap();
        let memory = Arc::new(Mutex::new(PlcMemory {
            registers: (0..=u16::MAX).collect(),
            coils: vec![false; 0x1_0000],
            delays: HashMap::new(),
            exceptions: HashMap::new(),
            seen: Vec::new(),
            trickle: false,
        }));
        let accepted = Arc::new(AtomicUsize::new(0));
        let accept_times = Arc::new(Mutex::new(Vec::new()));
        let (kill, _) = broadcast::channel(4);

        let task = {
            let memory = Arc::clone(&memory);
            let accepted = Arc::clone(&accepted);
            let accept_times = Arc::clone(&accept_times);
            let kill = kill.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else { return };
                    accept_times.lock().unwrap().push(Instant::now());
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, Arc::clone(&memory), kill.subscribe()));
                }
            })
        };

        Self {
            addr,
            memory,
            accepted,
            accept_times,
            kill,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Endpoint config pointing at this server with short test timings.
    pub fn config(&self) -> EndpointConfig {
        EndpointConfig::new("fake-plc", "127.0.0.1")
            .with_port(self.port())
            .with_timeout(Duration::from_millis(500))
            .with_request_timeout(Duration::from_millis(1000))
            .with_retry(2, Duration::from_millis(50))
            .with_keep_alive(false)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn last_accept_at(&self) -> Option<Instant> {
        self.accept_times.lock().unwrap().last().copied()
    }

    pub fn register(&self, address: u16) -> u16 {
        self.memory.lock().unwrap().registers[address as usize]
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.memory.lock().unwrap().registers[address as usize] = value;
    }

    pub fn coil(&self, address: u16) -> bool {
        self.memory.lock().unwrap().coils[address as usize]
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.memory.lock().unwrap().coils[address as usize] = value;
    }

    pub fn delay(&self, address: u16, delay: Duration) {
        self.memory.lock().unwrap().delays.insert(address, delay);
    }

    pub fn exception(&self, address: u16, code: u8) {
        self.memory.lock().unwrap().exceptions.insert(address, code);
    }

    pub fn trickle(&self, enabled: bool) {
        self.memory.lock().unwrap().trickle = enabled;
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.memory.lock().unwrap().seen.clone()
    }

    /// Drops every open client socket; the listener keeps accepting.
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    pub fn stop(&self) {
        self.task.abort();
        self.kill_connections();
    }
}

impl Drop for FakePlc {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(socket: TcpStream, memory: Arc<Mutex<PlcMemory>>, mut kill: broadcast::Receiver<()>) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<(Vec<u8>, bool)>();

    let writer_task = tokio::spawn(async move {
        while let Some((frame, trickle)) = rx.recv().await {
            if trickle {
                for byte in frame {
                    if writer.write_all(&[byte]).await.is_err() {
                        return;
                    }
                    let _ = writer.flush().await;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            } else if writer.write_all(&frame).await.is_err() {
                return;
            }
        }
    });

    loop {
        let mut header = [0u8; 7];
        tokio::select! {
            read = reader.read_exact(&mut header) => {
                if read.is_err() {
                    break;
                }
            }
            _ = kill.recv() => break,
        }

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        if reader.read_exact(&mut pdu).await.is_err() {
            break;
        }

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let unit_id = header[6];
        let (response, delay, trickle) = respond(&memory, transaction_id, unit_id, &pdu);

        let mut frame = Vec::with_capacity(7 + response.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(&response);

        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send((frame, trickle));
        });
    }

    writer_task.abort();
}

fn respond(memory: &Mutex<PlcMemory>, transaction_id: u16, unit_id: u8, pdu: &[u8]) -> (Vec<u8>, Option<Duration>, bool) {
    let mut memory = memory.lock().unwrap();
    let function = pdu[0];
    let address = u16::from_be_bytes([pdu[1], pdu[2]]);
    let field = u16::from_be_bytes([pdu[3], pdu[4]]);

    memory.seen.push(SeenRequest {
        transaction_id,
        unit_id,
        function,
        address,
    });
    let delay = memory.delays.get(&address).copied();
    let trickle = memory.trickle;

    if let Some(code) = memory.exceptions.get(&address) {
        return (vec![function | 0x80, *code], delay, trickle);
    }

    let start = address as usize;
    let response = match function {
        0x03 | 0x04 => {
            let count = field as usize;
            let mut out = vec![function, (count * 2) as u8];
            for value in &memory.registers[start..start + count] {
                out.extend_from_slice(&value.to_be_bytes());
            }
            out
        }
        0x01 | 0x02 => {
            let count = field as usize;
            let mut packed = vec![0u8; (count + 7) / 8];
            for (i, on) in memory.coils[start..start + count].iter().enumerate() {
                if *on {
                    packed[i / 8] |= 1 << (i % 8);
                }
            }
            let mut out = vec![function, packed.len() as u8];
            out.extend_from_slice(&packed);
            out
        }
        0x05 => {
            memory.coils[start] = field == 0xFF00;
            pdu[..5].to_vec()
        }
        0x06 => {
            memory.registers[start] = field;
            pdu[..5].to_vec()
        }
        0x0F => {
            let count = field as usize;
            let bytes = &pdu[6..];
            for i in 0..count {
                memory.coils[start + i] = bytes[i / 8] & (1 << (i % 8)) != 0;
            }
            pdu[..5].to_vec()
        }
        0x10 => {
            let count = field as usize;
            for i in 0..count {
                memory.registers[start + i] = u16::from_be_bytes([pdu[6 + i * 2], pdu[7 + i * 2]]);
            }
            pdu[..5].to_vec()
        }
        _ => vec![function | 0x80, 0x01],
    };

    (response, delay, trickle)
}
