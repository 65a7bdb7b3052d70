mod common;

use std::time::Duration;

use common::MockBackend;
use mobile_adapter::adapter::AdapterConfig;
use mobile_adapter::bgb::{
    BgbBridge, BgbError, BgbLink, BgbPacket, LinkHandler, CMD_JOYPAD, CMD_SYNC1, CMD_SYNC2,
    CMD_SYNC3, CMD_VERSION, PACKET_SIZE, STATUS_PAUSED, STATUS_RUNNING, SYNC2_CONTROL,
};
use mobile_adapter::serial::packet::encode_frame;
use mobile_adapter::serial::IDLE_BYTE;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Master side of the link, as the emulator drives it
struct Emulator {
    stream: DuplexStream,
    timestamp: u32,
}

impl Emulator {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            timestamp: 0,
        }
    }

    async fn send(&mut self, packet: BgbPacket) {
        self.stream.write_all(&packet.to_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> BgbPacket {
        let mut buf = [0u8; PACKET_SIZE];
        self.stream.read_exact(&mut buf).await.unwrap();
        BgbPacket::from_bytes(&buf)
    }

    async fn handshake(&mut self) {
        assert_eq!(self.recv().await, BgbPacket::version());
        self.send(BgbPacket::version()).await;
        assert_eq!(
            self.recv().await,
            BgbPacket::status(STATUS_RUNNING | STATUS_PAUSED)
        );
    }

    async fn exchange(&mut self, byte: u8) -> u8 {
        self.timestamp += 1000;
        self.send(BgbPacket {
            cmd: CMD_SYNC1,
            b2: byte,
            b3: 0x81,
            b4: 0,
            timestamp: self.timestamp,
        })
        .await;
        let reply = self.recv().await;
        assert_eq!(reply.cmd, CMD_SYNC2);
        assert_eq!(reply.b3, SYNC2_CONTROL);
        reply.b2
    }

    /// Send one packet and collect the reply's command byte and data
    async fn request(&mut self, command: u8, data: &[u8]) -> (u8, Vec<u8>) {
        for byte in encode_frame(command, data, false) {
            self.exchange(byte).await;
        }
        assert_eq!(self.exchange(0x80).await, 0x88);
        assert_eq!(self.exchange(0x00).await, command ^ 0x80);

        let mut previous = 0x00;
        let mut found = false;
        for _ in 0..500 {
            let byte = self.exchange(0x4B).await;
            if previous == 0x99 && byte == 0x66 {
                found = true;
                break;
            }
            previous = byte;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(found, "no reply to 0x{:02X}", command);

        let mut header = [0u8; 4];
        for byte in header.iter_mut() {
            *byte = self.exchange(0x4B).await;
        }
        let mut reply = Vec::new();
        for _ in 0..header[3] {
            reply.push(self.exchange(0x4B).await);
        }
        self.exchange(0x4B).await;
        self.exchange(0x4B).await;
        assert_eq!(self.exchange(0x80).await, 0x88);
        self.exchange(header[0] ^ 0x80).await;
        (header[0], reply)
    }
}

#[tokio::test]
async fn test_session_over_link() {
    let (ours, theirs) = tokio::io::duplex(1024);
    let mut backend = MockBackend::new();
    backend.config[0] = 0x77;

    let mut bridge = BgbBridge::start(AdapterConfig::default(), backend).unwrap();
    let adapter = bridge.adapter();
    let time = bridge.time().clone();
    let link = tokio::spawn(async move {
        let res = bridge.serve(ours).await;
        (bridge, res)
    });

    let mut emu = Emulator::new(theirs);
    emu.handshake().await;

    let (command, data) = emu.request(0x10, b"NINTENDO").await;
    assert_eq!(command, 0x90);
    assert_eq!(data, b"NINTENDO");
    assert!(adapter.lock().unwrap().session_begun());
    assert_eq!(time.now(), emu.timestamp);

    // Answered by the action worker
    let (command, data) = emu.request(0x19, &[0x00, 0x01]).await;
    assert_eq!(command, 0x99);
    assert_eq!(data, vec![0x00, 0x77]);

    emu.send(BgbPacket::want_disconnect()).await;
    let (bridge, res) = link.await.unwrap();
    res.unwrap();
    bridge.shutdown();
}

#[tokio::test]
async fn test_control_packets() {
    let (ours, theirs) = tokio::io::duplex(1024);
    let mut bridge = BgbBridge::start(AdapterConfig::default(), MockBackend::new()).unwrap();
    let time = bridge.time().clone();
    let link = tokio::spawn(async move {
        let res = bridge.serve(ours).await;
        (bridge, res)
    });

    let mut emu = Emulator::new(theirs);
    emu.handshake().await;

    let sync = BgbPacket::sync3_timestamp(5000);
    emu.send(sync).await;
    assert_eq!(emu.recv().await, sync);
    assert_eq!(time.now(), 5000);

    // None of these get an answer
    emu.send(BgbPacket {
        cmd: CMD_SYNC3,
        b2: 1,
        ..BgbPacket::default()
    })
    .await;
    emu.send(BgbPacket {
        cmd: CMD_JOYPAD,
        b2: 0x05,
        ..BgbPacket::default()
    })
    .await;
    emu.send(BgbPacket {
        cmd: 200,
        ..BgbPacket::default()
    })
    .await;
    emu.send(BgbPacket::version()).await;

    // Status is answered once
    emu.send(BgbPacket::status(STATUS_RUNNING)).await;
    assert_eq!(emu.recv().await, BgbPacket::status(STATUS_RUNNING));
    emu.send(BgbPacket::status(STATUS_RUNNING)).await;

    assert_eq!(emu.exchange(0x00).await, IDLE_BYTE);

    drop(emu);
    let (bridge, res) = link.await.unwrap();
    res.unwrap();
    bridge.shutdown();
}

/// Answers every byte with its complement
#[derive(Default)]
struct Complement {
    seen: Vec<(u8, u32)>,
    synced: Vec<u32>,
}

impl LinkHandler for Complement {
    fn transfer(&mut self, byte: u8, timestamp: u32) -> u8 {
        self.seen.push((byte, timestamp));
        !byte
    }

    fn sync_time(&mut self, timestamp: u32) {
        self.synced.push(timestamp);
    }
}

#[tokio::test]
async fn test_transfer_reply_lags_one_byte() {
    let (ours, theirs) = tokio::io::duplex(1024);
    let link = tokio::spawn(async move {
        let mut handler = Complement::default();
        let res = BgbLink::new(ours).run(&mut handler).await;
        (handler, res)
    });

    let mut emu = Emulator::new(theirs);
    emu.handshake().await;
    assert_eq!(emu.exchange(0x01).await, IDLE_BYTE);
    assert_eq!(emu.exchange(0x02).await, 0xFE);
    assert_eq!(emu.exchange(0x03).await, 0xFD);
    emu.send(BgbPacket::sync3_timestamp(42)).await;
    emu.recv().await;
    drop(emu);

    let (handler, res) = link.await.unwrap();
    res.unwrap();
    assert_eq!(handler.seen, vec![(0x01, 1000), (0x02, 2000), (0x03, 3000)]);
    assert_eq!(handler.synced, vec![42]);
}

#[tokio::test]
async fn test_version_mismatch_ends_link() {
    let (ours, mut theirs) = tokio::io::duplex(1024);
    let link = tokio::spawn(async move {
        let mut handler = Complement::default();
        BgbLink::new(ours).run(&mut handler).await
    });

    let mut buf = [0u8; PACKET_SIZE];
    theirs.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf[0], CMD_VERSION);

    let old = BgbPacket {
        cmd: CMD_VERSION,
        b2: 1,
        b3: 3,
        b4: 0,
        timestamp: 0,
    };
    theirs.write_all(&old.to_bytes()).await.unwrap();

    let res = link.await.unwrap();
    assert!(matches!(res, Err(BgbError::VersionMismatch(1, 3, 0))));
}
