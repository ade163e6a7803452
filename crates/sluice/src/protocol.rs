//! MariaDB replication wire protocol
//!
//! Implements the client side of binlog replication:
//! - Handshake and authentication (`mysql_native_password`, `client_ed25519`)
//! - `COM_QUERY` for session setup statements
//! - `COM_REGISTER_SLAVE`
//! - `COM_BINLOG_DUMP` with the starting position taken from the
//!   `@slave_connect_state` session variable
//! - Binlog event packet streaming
//!
//! ## Authentication
//!
//! ### mysql_native_password
//! Uses SHA1 hashing: `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`
//!
//! ### client_ed25519 (MariaDB)
//! Derives an Ed25519 keypair from SHA-512(password), signs the server's
//! random nonce and sends the 64-byte signature.

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::io::Read;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// MySQL packet header size (3 bytes length + 1 byte sequence)
const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload
const MAX_PACKET_SIZE: usize = 16_777_215;
/// Timeout for the initial TCP connect
const CONNECT_TIMEOUT_SECS: u64 = 10;
/// Timeout for command round-trips. Binlog event reads are exempt: the
/// stream legitimately idles until the next upstream transaction.
const COMMAND_TIMEOUT_SECS: u64 = 30;

/// Capability flags exchanged during the handshake.
pub struct CapabilityFlags;

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

    /// Default client capabilities for replication connections.
    pub fn default_client() -> u32 {
        Self::CLIENT_LONG_PASSWORD
            | Self::CLIENT_LONG_FLAG
            | Self::CLIENT_PROTOCOL_41
            | Self::CLIENT_TRANSACTIONS
            | Self::CLIENT_SECURE_CONNECTION
            | Self::CLIENT_PLUGIN_AUTH
            | Self::CLIENT_DEPRECATE_EOF
    }
}

/// Initial greeting from the server.
#[derive(Debug)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: Vec<u8>,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let mut buf = [0u8; 1];

        Read::read_exact(&mut cursor, &mut buf)?;
        let protocol_version = buf[0];

        let mut server_version = Vec::new();
        loop {
            Read::read_exact(&mut cursor, &mut buf)?;
            if buf[0] == 0 {
                break;
            }
            server_version.push(buf[0]);
        }
        let server_version = String::from_utf8_lossy(&server_version).to_string();

        let mut buf4 = [0u8; 4];
        Read::read_exact(&mut cursor, &mut buf4)?;
        let connection_id = u32::from_le_bytes(buf4);

        let mut auth_plugin_data_part1 = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut auth_plugin_data_part1)?;

        Read::read_exact(&mut cursor, &mut buf)?; // filler

        let mut buf2 = [0u8; 2];
        Read::read_exact(&mut cursor, &mut buf2)?;
        let cap_lower = u16::from_le_bytes(buf2);

        Read::read_exact(&mut cursor, &mut buf)?;
        let character_set = buf[0];

        Read::read_exact(&mut cursor, &mut buf2)?;
        let status_flags = u16::from_le_bytes(buf2);

        Read::read_exact(&mut cursor, &mut buf2)?;
        let cap_upper = u16::from_le_bytes(buf2);
        let capability_flags = ((cap_upper as u32) << 16) | (cap_lower as u32);

        Read::read_exact(&mut cursor, &mut buf)?;
        let auth_data_len = buf[0] as usize;

        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)?;

        let remaining_len = if auth_data_len > 8 {
            auth_data_len - 8
        } else {
            13
        };
        let mut auth_plugin_data_part2 = vec![0u8; remaining_len];
        Read::read_exact(&mut cursor, &mut auth_plugin_data_part2)?;
        if let Some(pos) = auth_plugin_data_part2.iter().position(|&b| b == 0) {
            auth_plugin_data_part2.truncate(pos);
        }

        let mut auth_plugin_name = Vec::new();
        if capability_flags & CapabilityFlags::CLIENT_PLUGIN_AUTH != 0 {
            loop {
                let n = Read::read(&mut cursor, &mut buf)?;
                if n == 0 || buf[0] == 0 {
                    break;
                }
                auth_plugin_name.push(buf[0]);
            }
        }
        let auth_plugin_name = String::from_utf8_lossy(&auth_plugin_name).to_string();

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }

    /// Full auth data (salt)
    pub fn auth_data(&self) -> Vec<u8> {
        let mut data = self.auth_plugin_data_part1.clone();
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }
}

/// An authenticated replication connection.
pub struct BinlogConnection {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for BinlogConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogConnection")
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl BinlogConnection {
    /// Connect and authenticate.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        debug!("Connecting to {}", addr);

        let tcp_stream = match timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e).context(format!("failed to connect to {addr}")),
            Err(_) => bail!("connection to {addr} timed out after {CONNECT_TIMEOUT_SECS}s"),
        };

        let mut connection = Self {
            stream: BufReader::new(tcp_stream),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
        };

        let handshake_data = connection.read_packet_timeout().await?;
        let handshake =
            HandshakePacket::parse(&handshake_data).context("failed to parse handshake packet")?;

        info!(
            "Connected to {} (connection_id={})",
            handshake.server_version, handshake.connection_id
        );
        debug!("Auth plugin: {}", handshake.auth_plugin_name);

        connection.server_version = handshake.server_version.clone();
        connection.connection_id = handshake.connection_id;
        connection.authenticate(user, password, &handshake).await?;

        Ok(connection)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        handshake: &HandshakePacket,
    ) -> Result<()> {
        let auth_response = match handshake.auth_plugin_name.as_str() {
            "mysql_native_password" => mysql_native_password(password, &handshake.auth_data()),
            "client_ed25519" => client_ed25519(password, &handshake.auth_data()),
            other => {
                warn!("Unknown auth plugin: {}, trying mysql_native_password", other);
                mysql_native_password(password, &handshake.auth_data())
            }
        };

        let mut response = BytesMut::with_capacity(256);
        response.put_u32_le(CapabilityFlags::default_client());
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(45); // utf8mb4
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        response.put_slice(handshake.auth_plugin_name.as_bytes());
        response.put_u8(0);

        self.write_packet(&response).await?;

        let resp = self.read_packet_timeout().await?;
        match resp.first() {
            Some(0x00) => {
                debug!("Authentication successful");
                Ok(())
            }
            Some(0xFF) => {
                let (code, msg) = parse_err_packet(&resp);
                bail!("authentication failed: {} - {}", code, msg);
            }
            Some(0xFE) => {
                let plugin_end = resp[1..].iter().position(|&b| b == 0).unwrap_or(resp.len() - 1);
                let plugin = String::from_utf8_lossy(&resp[1..1 + plugin_end]).to_string();
                let auth_data = resp[2 + plugin_end..].to_vec();
                debug!("Auth switch to plugin: {}", plugin);
                self.handle_auth_switch(&plugin, &auth_data, password).await
            }
            Some(other) => bail!("unexpected auth response: 0x{:02X}", other),
            None => bail!("empty auth response"),
        }
    }

    async fn handle_auth_switch(
        &mut self,
        plugin: &str,
        auth_data: &[u8],
        password: Option<&str>,
    ) -> Result<()> {
        let auth_response = match plugin {
            "mysql_native_password" => mysql_native_password(password, auth_data),
            "client_ed25519" => client_ed25519(password, auth_data),
            _ => bail!("unsupported auth plugin for switch: {}", plugin),
        };

        self.write_packet(&auth_response).await?;

        let resp = self.read_packet_timeout().await?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => {
                let (code, msg) = parse_err_packet(&resp);
                bail!("auth switch failed: {} - {}", code, msg);
            }
            _ => bail!("unexpected auth switch response"),
        }
    }

    /// Execute a statement, expecting OK or an error. Result sets are
    /// drained and discarded; session setup only needs the status.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(0x03); // COM_QUERY
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet).await?;

        let resp = self.read_packet_timeout().await?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => {
                let (code, msg) = parse_err_packet(&resp);
                bail!("query failed: {} - {}", code, msg);
            }
            _ => Ok(()), // result set header; not used for session setup
        }
    }

    /// Register this connection as a replica.
    pub async fn register_slave(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(0x15); // COM_REGISTER_SLAVE
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id

        self.write_packet(&packet).await?;

        let resp = self.read_packet_timeout().await?;
        match resp.first() {
            Some(0x00) => {
                info!("Registered as replica with server_id={}", server_id);
                Ok(())
            }
            Some(0xFF) => {
                let (code, msg) = parse_err_packet(&resp);
                bail!("failed to register as replica: {} - {}", code, msg);
            }
            _ => bail!("unexpected response to COM_REGISTER_SLAVE"),
        }
    }

    /// Start the binlog dump. With `@slave_connect_state` set on the
    /// session, the server picks the starting position from the GTID state
    /// and the filename stays empty.
    pub async fn binlog_dump(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(11);
        packet.put_u8(0x12); // COM_BINLOG_DUMP
        packet.put_u32_le(4); // position: start-of-log sentinel
        packet.put_u16_le(0); // flags
        packet.put_u32_le(server_id);
        // empty binlog filename

        self.write_packet(&packet).await?;
        debug!("Started binlog dump");
        Ok(())
    }

    /// Read the next binlog event frame. Returns `None` on a clean EOF.
    /// This read has no timeout: an idle upstream is not an error.
    pub async fn next_event_packet(&mut self) -> Result<Option<Bytes>> {
        let packet = self.read_packet().await?;

        if packet.is_empty() {
            return Ok(None);
        }

        match packet[0] {
            0x00 => Ok(Some(Bytes::from(packet[1..].to_vec()))),
            0xFE if packet.len() < 9 => {
                debug!("Received EOF in binlog stream");
                Ok(None)
            }
            0xFF => {
                let (code, msg) = parse_err_packet(&packet);
                bail!("binlog stream error: {} - {}", code, msg);
            }
            _ => Ok(Some(Bytes::from(packet))),
        }
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;

        let payload_len =
            (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
        self.sequence_id = header[3].wrapping_add(1);

        let mut payload = vec![0u8; payload_len];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    async fn read_packet_timeout(&mut self) -> Result<Vec<u8>> {
        timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS), self.read_packet())
            .await
            .map_err(|_| anyhow::anyhow!("read timed out after {COMMAND_TIMEOUT_SECS}s"))?
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len > MAX_PACKET_SIZE {
            bail!("packet too large: {} bytes", len);
        }

        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + len);
        packet.push((len & 0xFF) as u8);
        packet.push(((len >> 8) & 0xFF) as u8);
        packet.push(((len >> 16) & 0xFF) as u8);
        packet.push(self.sequence_id);
        packet.extend_from_slice(data);

        timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS), async {
            self.stream.get_mut().write_all(&packet).await?;
            self.stream.get_mut().flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|_| anyhow::anyhow!("write timed out after {COMMAND_TIMEOUT_SECS}s"))??;

        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }
}

fn parse_err_packet(packet: &[u8]) -> (u16, String) {
    if packet.len() < 9 {
        return (0, "truncated error packet".to_string());
    }
    let code = u16::from_le_bytes([packet[1], packet[2]]);
    let msg = String::from_utf8_lossy(&packet[9..]).to_string();
    (code, msg)
}

/// mysql_native_password scramble
fn mysql_native_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            // SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
            let mut hasher = Sha1::new();
            hasher.update(pwd.as_bytes());
            let stage1 = hasher.finalize();

            let mut hasher = Sha1::new();
            hasher.update(stage1);
            let stage2 = hasher.finalize();

            let mut hasher = Sha1::new();
            hasher.update(salt);
            hasher.update(stage2);
            let stage3 = hasher.finalize();

            stage1
                .iter()
                .zip(stage3.iter())
                .map(|(a, b)| a ^ b)
                .collect()
        }
    }
}

/// client_ed25519 signature (MariaDB)
///
/// The Ed25519 seed is the first 32 bytes of SHA-512(password); the client
/// signs the server's nonce and sends the 64-byte signature.
fn client_ed25519(password: Option<&str>, nonce: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            use ed25519_dalek::{Signer, SigningKey};
            use sha2::{Digest as Sha2Digest, Sha512};

            let mut hasher = Sha512::new();
            hasher.update(pwd.as_bytes());
            let hash = hasher.finalize();

            let seed: [u8; 32] = match hash[..32].try_into() {
                Ok(s) => s,
                Err(_) => return vec![],
            };

            let signing_key = SigningKey::from_bytes(&seed);
            signing_key.sign(nonce).to_bytes().to_vec()
        }
    }
}
