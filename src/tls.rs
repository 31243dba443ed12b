//! TLS support: context construction from declarative options, the
//! ticket-key file layout, peer identity extraction and the `Io` backend that
//! drives handshakes, rekeys and the bidirectional shutdown.

use std::fs;
use std::io::{self};
use std::path::PathBuf;
use std::sync::Arc;

use mio::{Registry, Token};
use openssl::dh::Dh;
use openssl::ec::EcKey;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::ssl::{
    ErrorCode, ShutdownResult, Ssl, SslContext as EngineContext, SslContextBuilder, SslFiletype,
    SslMethod, SslMode, SslOptions, SslSessionCacheMode, SslStream, SslVerifyMode, SslVersion,
};
use openssl::x509::{X509NameRef, X509};
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io::{Io, IoAction, IoPrologue, IoStatus};
use crate::socket::{ConnectProbe, StreamSocket};

/// Cipher lists mirror a hardened deployment profile: ephemeral key exchange
/// with GCM preferred; the legacy profile additionally admits static-RSA key
/// exchange and 3DES for old peers.
const ENHANCED_CIPHERS: &str = "ECDH+AESGCM:DH+AESGCM:\
                                ECDH+AES:DH+AES:\
                                !AES256:!SHA:!MD5:!DSS:!aNULL:!eNULL";

const LEGACY_CIPHERS: &str = "ECDH+AESGCM:DH+AESGCM:\
                              ECDH+AES:DH+AES:\
                              ECDH+3DES:DH+3DES:\
                              kRSA+AESGCM:kRSA+AES:kRSA+3DES:\
                              !AES256:!MD5:!DSS:!aNULL:!eNULL";

/// Declarative TLS settings, loadable from configuration files.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsOptions {
    /// PEM certificate chain (leaf first).
    pub certificate_chain: Option<PathBuf>,
    /// Single PEM certificate, for setups without intermediates.
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    /// Passphrase protecting the private key, if any.
    pub passphrase: Option<String>,
    /// Trusted CA certificates, also announced as acceptable client CAs.
    pub trusted_ca: Vec<PathBuf>,
    /// PEM DH parameters; a built-in 2048-bit group is used when absent.
    pub dh_params: Option<PathBuf>,
    pub verify_peer: bool,
    /// Reject peers that present no certificate at all.
    pub require_peer_certificate: bool,
    /// Enables the server-side session cache under this context id.
    pub session_id_context: Option<String>,
    pub allow_tickets: bool,
    /// Ticket keys, current first, previous after, for rotation.
    pub ticket_key_files: Vec<PathBuf>,
    /// Enhanced mode: TLS 1.2 floor and the strict cipher list. Legacy mode
    /// lowers the floor to TLS 1.0 and admits the wider list.
    pub enhanced_security: bool,
}

impl Default for TlsOptions {
    fn default() -> TlsOptions {
        TlsOptions {
            certificate_chain: None,
            certificate: None,
            private_key: None,
            passphrase: None,
            trusted_ca: Vec::new(),
            dh_params: None,
            verify_peer: false,
            require_peer_certificate: false,
            session_id_context: None,
            allow_tickets: false,
            ticket_key_files: Vec::new(),
            enhanced_security: true,
        }
    }
}

/// One session-ticket key in the fixed on-disk layout:
/// `name[16] || hmac_key[16|32] || enc_key[16|32]`, 48 bytes total for the
/// 128-bit flavor and 80 bytes for the 256-bit one.
#[derive(Clone, PartialEq, Eq)]
pub struct TicketKey {
    pub name: [u8; 16],
    pub hmac_key: Vec<u8>,
    pub enc_key: Vec<u8>,
}

impl TicketKey {
    pub const SIZE_128: usize = 48;
    pub const SIZE_256: usize = 80;

    /// Parses one key from the fixed layout.
    pub fn parse(raw: &[u8]) -> Result<TicketKey> {
        let half = match raw.len() {
            Self::SIZE_128 => 16,
            Self::SIZE_256 => 32,
            n => {
                return Err(Error::Config(format!(
                    "ticket key must be {} or {} bytes, got {}",
                    Self::SIZE_128,
                    Self::SIZE_256,
                    n
                )))
            }
        };

        let mut name = [0u8; 16];
        name.copy_from_slice(&raw[..16]);

        Ok(TicketKey {
            name,
            hmac_key: raw[16..16 + half].to_vec(),
            enc_key: raw[16 + half..].to_vec(),
        })
    }

    /// Key strength in bits.
    #[inline]
    pub fn bits(&self) -> usize {
        self.enc_key.len() * 8
    }
}

impl std::fmt::Debug for TicketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("TicketKey")
            .field("name", &self.name)
            .field("bits", &self.bits())
            .finish()
    }
}

/// Identity of an authenticated TLS peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsPeer {
    subject_name: String,
    issuer_name: String,
    serial_number: u64,
}

impl TlsPeer {
    #[inline]
    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    #[inline]
    pub fn issuer_name(&self) -> &str {
        &self.issuer_name
    }

    #[inline]
    pub fn serial_number(&self) -> u64 {
        self.serial_number
    }
}

/// A built TLS context, cheap to clone and shared by every connection of one
/// listener or outgoing destination.
#[derive(Clone)]
pub struct TlsContext {
    engine: EngineContext,
    ticket_keys: Arc<Vec<TicketKey>>,
}

impl TlsContext {
    /// Builds an engine context from the options. Certificate, key and CA
    /// material is validated here so misconfiguration fails the call instead
    /// of the first handshake.
    pub fn build(options: &TlsOptions) -> Result<TlsContext> {
        openssl::init();

        let mut builder = SslContextBuilder::new(SslMethod::tls())?;

        let ciphers = if options.enhanced_security {
            ENHANCED_CIPHERS
        } else {
            LEGACY_CIPHERS
        };
        builder.set_cipher_list(ciphers)?;

        let floor = if options.enhanced_security {
            SslVersion::TLS1_2
        } else {
            SslVersion::TLS1
        };
        builder.set_min_proto_version(Some(floor))?;

        let mut engine_options = SslOptions::NO_COMPRESSION
            | SslOptions::SINGLE_DH_USE
            | SslOptions::SINGLE_ECDH_USE
            | SslOptions::CIPHER_SERVER_PREFERENCE;
        if !options.allow_tickets {
            engine_options |= SslOptions::NO_TICKET;
        }
        builder.set_options(engine_options);

        // A retried write may legitimately hand over a different buffer
        // address for the same bytes once the send queue has been re-packed.
        builder.set_mode(SslMode::ACCEPT_MOVING_WRITE_BUFFER);

        builder.set_session_cache_mode(SslSessionCacheMode::OFF);

        match &options.dh_params {
            Some(path) => builder.set_tmp_dh(&*Dh::params_from_pem(&fs::read(path)?)?)?,
            None => builder.set_tmp_dh(&*Dh::get_2048_256()?)?,
        }
        builder.set_tmp_ecdh(&*EcKey::from_curve_name(Nid::X9_62_PRIME256V1)?)?;

        if let Some(path) = &options.certificate_chain {
            builder.set_certificate_chain_file(path)?;
        }

        if let Some(path) = &options.certificate {
            builder.set_certificate_file(path, SslFiletype::PEM)?;
        }

        if let Some(path) = &options.private_key {
            let pem = fs::read(path)?;
            let key = match &options.passphrase {
                Some(passphrase) => {
                    PKey::private_key_from_pem_passphrase(&pem, passphrase.as_bytes())?
                }
                None => PKey::private_key_from_pem(&pem)?,
            };
            builder.set_private_key(&key)?;
            builder.check_private_key()?;
        }

        for path in &options.trusted_ca {
            let certificate = X509::from_pem(&fs::read(path)?)?;
            builder.cert_store_mut().add_cert(certificate.clone())?;
            builder.add_client_ca(&certificate)?;
        }

        if options.verify_peer {
            let mut mode = SslVerifyMode::PEER | SslVerifyMode::CLIENT_ONCE;
            if options.require_peer_certificate {
                mode |= SslVerifyMode::FAIL_IF_NO_PEER_CERT;
            }
            builder.set_verify(mode);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }

        if let Some(context_id) = &options.session_id_context {
            builder.set_session_id_context(context_id.as_bytes())?;
            builder.set_session_cache_mode(SslSessionCacheMode::SERVER);
        }

        let mut ticket_keys = Vec::with_capacity(options.ticket_key_files.len());
        for path in &options.ticket_key_files {
            ticket_keys.push(TicketKey::parse(&fs::read(path)?)?);
        }

        Ok(TlsContext {
            engine: builder.build(),
            ticket_keys: Arc::new(ticket_keys),
        })
    }

    /// The ticket key rotation list loaded from the options, current first.
    #[inline]
    pub fn ticket_keys(&self) -> &[TicketKey] {
        &self.ticket_keys
    }
}

/// TLS socket backend. The handshake is advanced by repeated
/// `accept`/`connect` calls; shutdown exchanges close-notify in both
/// directions.
pub(crate) struct TlsIo {
    stream: SslStream<StreamSocket>,
    client: bool,
    socket_connecting: bool,
    peer: Option<TlsPeer>,
}

impl TlsIo {
    pub(crate) fn new(
        context: &TlsContext,
        socket: StreamSocket,
        client: bool,
        socket_connecting: bool,
    ) -> Result<TlsIo> {
        let mut ssl = Ssl::new(&context.engine)?;
        if client {
            ssl.set_connect_state();
        } else {
            ssl.set_accept_state();
        }

        Ok(TlsIo {
            stream: SslStream::new(ssl, socket)?,
            client,
            socket_connecting,
            peer: None,
        })
    }

    fn handshake_step(&mut self) -> IoStatus {
        match self.stream.do_handshake() {
            Ok(()) => {
                self.remember_peer();
                IoStatus::Ok
            }
            Err(err) => map_tls_error(err),
        }
    }

    fn remember_peer(&mut self) {
        if let Some(certificate) = self.stream.ssl().peer_certificate() {
            self.peer = Some(TlsPeer {
                subject_name: format_name(certificate.subject_name()),
                issuer_name: format_name(certificate.issuer_name()),
                serial_number: serial_number(&certificate),
            });
        }
    }
}

impl Io for TlsIo {
    fn prologue(&mut self) -> IoPrologue {
        if self.client {
            IoPrologue {
                immediate: IoAction::Connect,
                next: IoAction::None,
                wants_read: false,
                wants_write: true,
            }
        } else {
            IoPrologue {
                immediate: IoAction::Accept,
                next: IoAction::None,
                wants_read: true,
                wants_write: false,
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> (IoStatus, usize) {
        match self.stream.ssl_read(buf) {
            Ok(n) => (IoStatus::Ok, n),
            Err(err) => (map_tls_error(err), 0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> (IoStatus, usize) {
        match self.stream.ssl_write(buf) {
            Ok(n) => (IoStatus::Ok, n),
            Err(err) => (map_tls_error(err), 0),
        }
    }

    fn accept(&mut self) -> IoStatus {
        self.handshake_step()
    }

    fn connect(&mut self) -> IoStatus {
        if self.socket_connecting {
            match self.stream.get_ref().probe_connect() {
                ConnectProbe::Connected => self.socket_connecting = false,
                ConnectProbe::Pending => return IoStatus::WantWrite,
                ConnectProbe::Failed(err) => return IoStatus::Error(err),
            }
        }

        self.handshake_step()
    }

    fn shutdown(&mut self) -> IoStatus {
        match self.stream.shutdown() {
            // Our close-notify is out; hold on until the peer answers.
            Ok(ShutdownResult::Sent) => IoStatus::WantRead,
            Ok(ShutdownResult::Received) => IoStatus::Ok,
            Err(err) => match map_tls_error(err) {
                IoStatus::Closed => IoStatus::Ok,
                status => status,
            },
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            self.stream.get_mut(),
            token,
            mio::Interest::READABLE | mio::Interest::WRITABLE,
        )
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(self.stream.get_mut())
    }

    fn tls_peer(&self) -> Option<TlsPeer> {
        self.peer.clone()
    }
}

fn map_tls_error(err: openssl::ssl::Error) -> IoStatus {
    match err.code() {
        ErrorCode::WANT_READ => IoStatus::WantRead,
        ErrorCode::WANT_WRITE => IoStatus::WantWrite,
        ErrorCode::ZERO_RETURN => IoStatus::Closed,
        ErrorCode::SYSCALL => match err.into_io_error() {
            Ok(io_err) => match io_err.kind() {
                io::ErrorKind::WouldBlock => IoStatus::WantRead,
                io::ErrorKind::Interrupted => IoStatus::WantRead,
                _ => IoStatus::Error(io_err),
            },
            // An EOF in the middle of the protocol counts as the peer
            // hanging up.
            Err(_) => IoStatus::Closed,
        },
        _ => IoStatus::Error(io::Error::new(
            io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    }
}

/// Renders an X.509 name as `/KEY=value` segments.
fn format_name(name: &X509NameRef) -> String {
    let mut rendered = String::new();
    for entry in name.entries() {
        let key = entry
            .object()
            .nid()
            .short_name()
            .unwrap_or("UNKNOWN");
        let value = entry
            .data()
            .as_utf8()
            .map(|s| s.to_string())
            .unwrap_or_default();

        rendered.push('/');
        rendered.push_str(key);
        rendered.push('=');
        rendered.push_str(&value);
    }
    rendered
}

/// Low 64 bits of the certificate serial number.
fn serial_number(certificate: &X509) -> u64 {
    let bytes = match certificate.serial_number().to_bn() {
        Ok(bn) => bn.to_vec(),
        Err(_) => return 0,
    };

    bytes
        .iter()
        .rev()
        .take(8)
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}
