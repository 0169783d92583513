use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tnfsd::modules::proto::{Command, Datagram, OpenFlags, Reply};
use tnfsd::{spawn, ErrorCode, LogCrateSink, RunningServer, ServerConfig};

struct Client {
    socket: UdpSocket,
    server: SocketAddr,
    session_id: u16,
    sequence: u8,
}

impl Client {
    fn connect(server: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.set_read_timeout(Some(Duration::from_secs(2)))?;
        Ok(Self {
            socket,
            server,
            session_id: 0,
            sequence: 0,
        })
    }

    fn exchange(&mut self, dgram: &Datagram) -> Result<Vec<u8>> {
        self.socket.send_to(&dgram.encode(), self.server)?;
        let mut buf = [0u8; 600];
        let (len, _) = self.socket.recv_from(&mut buf)?;
        Ok(buf[..len].to_vec())
    }

    fn call(&mut self, cmd: Command, payload: Vec<u8>) -> Result<Reply> {
        self.sequence = self.sequence.wrapping_add(1);
        let dgram = Datagram {
            session_id: self.session_id,
            sequence: self.sequence,
            retry: false,
            opcode: cmd as u8,
            payload,
        };
        let bytes = self.exchange(&dgram)?;
        Reply::parse(&bytes).ok_or_else(|| anyhow!("short reply"))
    }

    fn mount(&mut self, path: &str) -> Result<Reply> {
        let mut payload = 0x0102u16.to_le_bytes().to_vec();
        payload.extend_from_slice(&cstr(path));
        payload.extend_from_slice(b"\0\0");
        let reply = self.call(Command::Mount, payload)?;
        self.session_id = reply.session_id;
        Ok(reply)
    }
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

fn open_payload(flags: OpenFlags, path: &str) -> Vec<u8> {
    let mut payload = flags.bits().to_le_bytes().to_vec();
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(&cstr(path));
    payload
}

fn start_server(root: &Path, read_only: bool) -> Result<RunningServer> {
    let config = ServerConfig::new(root)
        .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_port(0)
        .read_only(read_only);
    Ok(spawn(&config, Arc::new(LogCrateSink))?)
}

#[test]
fn test_file_round_trip_over_udp() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::create_dir(dir.path().join("disks"))?;
    let server = start_server(dir.path(), false)?;
    let mut client = Client::connect(server.local_addr())?;

    let mount = client.mount("/")?;
    assert!(mount.is_ok());
    assert_eq!(mount.session_id, 1);
    assert_eq!(mount.payload, vec![0x02, 0x01, 0xE8, 0x03]);

    let flags = OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE;
    let open = client.call(Command::Open, open_payload(flags, "/disks/dos.atr"))?;
    assert_eq!(open.payload, vec![1]);

    let mut write = vec![1];
    write.extend_from_slice(&5u16.to_le_bytes());
    write.extend_from_slice(b"ATARI");
    assert_eq!(client.call(Command::Write, write)?.payload, vec![5, 0]);

    let mut rewind = vec![1, 0];
    rewind.extend_from_slice(&0i32.to_le_bytes());
    assert!(client.call(Command::Seek, rewind)?.is_ok());

    let read = client.call(Command::Read, vec![1, 64, 0])?;
    assert_eq!(&read.payload[2..], b"ATARI");
    let eof = client.call(Command::Read, vec![1, 64, 0])?;
    assert_eq!(eof.status, ErrorCode::Eof.as_u8());

    assert!(client.call(Command::Close, vec![1])?.is_ok());
    assert_eq!(fs::read(dir.path().join("disks/dos.atr"))?, b"ATARI");

    let listing = client.call(Command::OpenDir, cstr("/disks"))?;
    assert_eq!(listing.payload, vec![1]);
    assert_eq!(client.call(Command::ReadDir, vec![1])?.payload, cstr("dos.atr"));
    assert_eq!(client.call(Command::ReadDir, vec![1])?.status, ErrorCode::Eof.as_u8());

    assert!(client.call(Command::Umount, Vec::new())?.is_ok());
    let gone = client.call(Command::Size, Vec::new())?;
    assert_eq!(gone.status, ErrorCode::InvalidSession.as_u8());

    server.stop();
    server.join()?;
    Ok(())
}

#[test]
fn test_retransmission_is_answered_from_cache() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("victim.txt"), "x")?;
    let server = start_server(dir.path(), false)?;
    let mut client = Client::connect(server.local_addr())?;
    client.mount("/")?;

    let unlink = Datagram {
        session_id: client.session_id,
        sequence: 42,
        retry: false,
        opcode: Command::Unlink as u8,
        payload: cstr("/victim.txt"),
    };
    let first = client.exchange(&unlink)?;
    assert_eq!(first[3], 0);

    fs::write(dir.path().join("victim.txt"), "back")?;
    let repeat = client.exchange(&Datagram {
        retry: true,
        ..unlink.clone()
    })?;
    assert_eq!(repeat, first);
    assert!(dir.path().join("victim.txt").exists());
    Ok(())
}

#[test]
fn test_read_only_server() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("keep.txt"), "keep")?;
    let server = start_server(dir.path(), true)?;
    let mut client = Client::connect(server.local_addr())?;
    assert!(client.mount("/")?.is_ok());

    let write_open = client.call(Command::Open, open_payload(OpenFlags::WRITE, "/keep.txt"))?;
    assert_eq!(write_open.status, ErrorCode::Perm.as_u8());
    let unlink = client.call(Command::Unlink, cstr("/keep.txt"))?;
    assert_eq!(unlink.status, ErrorCode::Perm.as_u8());
    assert!(client.call(Command::Stat, cstr("/keep.txt"))?.is_ok());
    assert_eq!(fs::read_to_string(dir.path().join("keep.txt"))?, "keep");
    Ok(())
}

#[test]
fn test_mount_outside_root_is_refused() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = start_server(dir.path(), false)?;
    let mut client = Client::connect(server.local_addr())?;
    let reply = client.mount("/../..")?;
    assert_eq!(reply.status, ErrorCode::Access.as_u8());
    assert_eq!(reply.session_id, 0);
    Ok(())
}
