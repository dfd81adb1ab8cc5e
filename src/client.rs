//! High-level tag client for Logix controllers.
//!
//! This module provides [`LogixClient`], the primary interface for reading and
//! writing controller tags by name.
//!
//! # Overview
//!
//! The client ties the layers together:
//! - Session registration and the Forward Open handshake ([`Connection`])
//! - Symbol and template upload into a shared [`SymbolCache`]
//! - Tag address parsing, request planning and batching
//! - Reply decoding, fragment reassembly and per-tag error reporting
//!
//! # Example
//!
//! ```no_run
//! use logix_cip::{ClientConfig, LogixClient, PlcValue};
//!
//! let config = ClientConfig::new("192.168.1.10/0")?;
//! let mut client = LogixClient::new(config)?;
//! client.open()?;
//!
//! // Read several tags in as few requests as the payload size allows
//! for tag in client.read(&["Counter", "MyArray[2]{3}", "Motor.Speed"])? {
//!     println!("{}: {:?} ({:?})", tag.tag, tag.value, tag.error);
//! }
//!
//! // Write a value and a single bit
//! client.write(&[("Counter", PlcValue::Dint(0)), ("Flags[3]", PlcValue::Bool(true))])?;
//!
//! client.close()?;
//! # Ok::<(), logix_cip::CipError>(())
//! ```
//!
//! # Errors
//!
//! Failures that concern a single tag (unknown name, rejected value, a CIP
//! error status for that tag) land in the tag's [`Tag::error`]; the call itself
//! still succeeds. Communication failures abort the whole call and leave the
//! connection disconnected.
//!
//! # Thread Safety
//!
//! A client owns its socket and is driven through `&mut self`, one request at
//! a time. The symbol cache is behind an `Arc` and can be handed to another
//! client with [`LogixClient::with_symbols`].

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::codec::PlcValue;
use crate::command::{
    self, Service, CLASS_IDENTITY, SERVICE_GET_ATTRIBUTES_ALL, SERVICE_MULTIPLE,
};
use crate::connection::{
    Connection, ConnectionConfig, ConnectionState, MessageChannel, DEFAULT_VENDOR_ID,
};
use crate::decoder::{decode_read, multi_service_replies, FragmentState};
use crate::discovery::Identity;
use crate::error::{CipError, Result};
use crate::path::{object_path, parse_connection_path, Segment};
use crate::planner::{plan_reads, plan_writes, Plan, Request};
use crate::response::CipReply;
use crate::symbols::{SymbolCache, TagInfo};
use crate::tag::TagAddress;
use crate::transport::{TcpTransport, Transport, DEFAULT_TIMEOUT};

/// Configuration for creating a [`LogixClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Controller (or gateway) host.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Route from the host to the controller.
    pub route: Vec<Segment>,
    /// Socket timeout.
    pub timeout: Duration,
    /// Try a Large Forward Open (4000 byte payload) first.
    pub large_packets: bool,
    /// Upload the symbol table when the client opens.
    pub init_tags: bool,
    /// Include program-scoped tags in the upload.
    pub init_program_tags: bool,
    /// Originator vendor id sent in Forward Open.
    pub vendor_id: u16,
    /// Requested packet interval in microseconds.
    pub rpi: u32,
}

impl ClientConfig {
    /// Creates a configuration from a `host[:port][/route]` connection string.
    ///
    /// Defaults: port 44818, backplane slot 0 when no route is given, 5 second
    /// timeout, large packets, and a full symbol upload on open.
    ///
    /// # Errors
    ///
    /// Returns `CipError::Path` for a malformed connection string.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::{ClientConfig, Segment};
    ///
    /// let config = ClientConfig::new("192.168.1.10/2").unwrap();
    /// assert_eq!(config.host, "192.168.1.10");
    /// assert_eq!(config.port, 44818);
    /// assert_eq!(config.route, vec![Segment::port(1, 2)]);
    /// ```
    pub fn new(path: &str) -> Result<Self> {
        let path = parse_connection_path(path)?;
        Ok(Self {
            host: path.host,
            port: path.port,
            route: path.route,
            timeout: DEFAULT_TIMEOUT,
            large_packets: true,
            init_tags: true,
            init_program_tags: true,
            vendor_id: DEFAULT_VENDOR_ID,
            rpi: command::DEFAULT_RPI,
        })
    }

    /// Sets a custom TCP port (default is 44818).
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::ClientConfig;
    ///
    /// let config = ClientConfig::new("192.168.1.10").unwrap().with_port(2222);
    /// assert_eq!(config.port, 2222);
    /// ```
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets a custom timeout (default is 5 seconds).
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::ClientConfig;
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig::new("192.168.1.10")
    ///     .unwrap()
    ///     .with_timeout(Duration::from_secs(1));
    /// ```
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables the Large Forward Open attempt.
    pub fn with_large_packets(mut self, enabled: bool) -> Self {
        self.large_packets = enabled;
        self
    }

    /// Enables or disables the symbol upload on open.
    ///
    /// Without it, only tags added to the cache by hand (or a cache shared
    /// through [`LogixClient::with_symbols`]) can be addressed.
    pub fn with_init_tags(mut self, enabled: bool) -> Self {
        self.init_tags = enabled;
        self
    }

    /// Enables or disables uploading program-scoped tags.
    pub fn with_init_program_tags(mut self, enabled: bool) -> Self {
        self.init_program_tags = enabled;
        self
    }

    /// Replaces the route to the controller. An empty route talks to the host
    /// itself.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::{ClientConfig, Segment};
    ///
    /// let config = ClientConfig::new("10.0.0.1")
    ///     .unwrap()
    ///     .with_route(vec![Segment::port(1, 4)]);
    /// assert_eq!(config.route, vec![Segment::port(1, 4)]);
    /// ```
    pub fn with_route(mut self, route: Vec<Segment>) -> Self {
        self.route = route;
        self
    }

    /// Sets the originator vendor id.
    pub fn with_vendor_id(mut self, vendor_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self
    }

    /// Sets the requested packet interval.
    pub fn with_rpi(mut self, rpi: u32) -> Self {
        self.rpi = rpi;
        self
    }

    /// Returns the transport-level subset of this configuration.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            route: self.route.clone(),
            timeout: self.timeout,
            large_packets: self.large_packets,
            vendor_id: self.vendor_id,
            rpi: self.rpi,
        }
    }
}

/// Result of reading or writing one tag.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Tag {
    /// The address text as given by the caller.
    pub tag: String,
    /// Value read, or the value written.
    pub value: Option<PlcValue>,
    /// Type name of the value, such as `DINT[3]` or `BOOL`.
    pub type_name: Option<String>,
    /// Error description when the operation failed for this tag.
    pub error: Option<String>,
}

impl Tag {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            value: None,
            type_name: None,
            error: None,
        }
    }

    fn fail(&mut self, err: &CipError) {
        self.value = None;
        self.error = Some(err.to_string());
    }

    /// Returns `true` when a value is present and no error was reported.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::{PlcValue, Tag};
    ///
    /// let tag = Tag {
    ///     tag: "Counter".into(),
    ///     value: Some(PlcValue::Dint(3)),
    ///     type_name: Some("DINT".into()),
    ///     error: None,
    /// };
    /// assert!(tag.is_ok());
    /// ```
    pub fn is_ok(&self) -> bool {
        self.value.is_some() && self.error.is_none()
    }
}

/// Outcome of one planned slot: the reply data, or the error for that slot.
type SlotOutcome = Option<Result<Vec<u8>>>;

/// Tag client for one Logix controller.
///
/// Each call produces the smallest number of requests the planner can pack.
/// No automatic retries or reconnection.
pub struct LogixClient<T: Transport = TcpTransport> {
    connection: Connection<T>,
    config: ClientConfig,
    symbols: Arc<SymbolCache>,
    shared_symbols: bool,
    identity: Option<Identity>,
}

impl LogixClient<TcpTransport> {
    /// Creates a client over TCP. Nothing is sent until [`open`](Self::open).
    ///
    /// # Errors
    ///
    /// Returns `CipError::Path` if the route cannot be encoded.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_transport(TcpTransport::new(), config)
    }
}

impl<T: Transport> LogixClient<T> {
    /// Creates a client over any transport.
    pub fn with_transport(transport: T, config: ClientConfig) -> Result<Self> {
        let connection = Connection::new(transport, config.connection_config())?;
        Ok(Self {
            connection,
            config,
            symbols: Arc::new(SymbolCache::new()),
            shared_symbols: false,
            identity: None,
        })
    }

    /// Uses an existing symbol cache instead of uploading one on open.
    ///
    /// The cache is typically taken from a sibling client with
    /// [`symbols`](Self::symbols).
    pub fn with_symbols(mut self, symbols: Arc<SymbolCache>) -> Self {
        self.symbols = symbols;
        self.shared_symbols = true;
        self
    }

    /// Registers a session, opens a connection, reads the controller identity
    /// and uploads the symbol table.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub fn open(&mut self) -> Result<()> {
        self.connection.open()?;
        self.connection.forward_open()?;
        let identity = self.get_plc_info()?;
        info!("connected to {} at {}", identity, self.config.host);

        if self.config.init_tags && !self.shared_symbols {
            let symbols = SymbolCache::upload(&mut self.connection, self.config.init_program_tags)?;
            self.symbols = Arc::new(symbols);
        }
        Ok(())
    }

    /// Closes the connection and session, best effort.
    ///
    /// # Errors
    ///
    /// Returns `CipError::Close` listing every failed step.
    pub fn close(&mut self) -> Result<()> {
        self.connection.close()
    }

    /// Returns `true` while the connected session is open.
    pub fn is_connected(&self) -> bool {
        self.connection.state() == ConnectionState::ConnectionOpen
    }

    /// Returns the connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> &Connection<T> {
        &self.connection
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the identity read on open, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Returns a handle to the symbol cache.
    pub fn symbols(&self) -> Arc<SymbolCache> {
        Arc::clone(&self.symbols)
    }

    /// Reads the controller's Identity object.
    pub fn get_plc_info(&mut self) -> Result<Identity> {
        let path = object_path(CLASS_IDENTITY, 1, None)?;
        let message = command::message_router_request(SERVICE_GET_ATTRIBUTES_ALL, &path, &[])?;
        let reply = self.connection.send(&message)?;
        reply.check_service(SERVICE_GET_ATTRIBUTES_ALL)?;
        reply.check_error()?;
        let identity = Identity::from_attributes_all(&reply.data)?;
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Sends List Identity over the open session.
    pub fn list_identity(&mut self) -> Result<Identity> {
        self.connection.list_identity()
    }

    /// Uploads the tags of one scope and returns them.
    ///
    /// `None` re-uploads the controller scope (and the programs, when program
    /// tags are enabled); `Some(program)` uploads that program's tags into a
    /// copy of the current cache. Either way the new cache replaces the old
    /// one as a whole, so clients sharing the old cache keep a consistent view.
    pub fn get_tag_list(&mut self, program: Option<&str>) -> Result<Vec<TagInfo>> {
        let symbols = match program {
            None => SymbolCache::upload(&mut self.connection, self.config.init_program_tags)?,
            Some(program) => {
                let mut symbols = (*self.symbols).clone();
                symbols.upload_scope(&mut self.connection, Some(program))?;
                symbols.resolve_templates(&mut self.connection)?;
                symbols
            }
        };
        let tags = symbols.tags(program).cloned().collect();
        self.symbols = Arc::new(symbols);
        Ok(tags)
    }

    /// Reads tags, returning one [`Tag`] per address in the same order.
    ///
    /// # Errors
    ///
    /// Only communication failures are returned as `Err`; anything that
    /// concerns a single tag is reported in that tag's `error`.
    pub fn read(&mut self, tags: &[&str]) -> Result<Vec<Tag>> {
        let symbols = Arc::clone(&self.symbols);
        let mut results: Vec<Tag> = tags.iter().map(|text| Tag::new(text)).collect();
        let addresses = parse_all(tags.iter().copied(), &symbols, &mut results);

        let items: Vec<(usize, &TagAddress)> = addresses
            .iter()
            .enumerate()
            .filter_map(|(i, address)| address.as_ref().map(|a| (i, a)))
            .collect();
        let plan = plan_reads(&items, &symbols, self.connection.payload_size());
        let outcomes = self.execute(&plan)?;

        for (slot, outcome) in outcomes.iter().enumerate() {
            for &caller in &plan.callers[slot] {
                let Some(address) = &addresses[caller] else {
                    continue;
                };
                let result = &mut results[caller];
                match outcome {
                    Some(Ok(data)) => match decode_read(address, data, &symbols) {
                        Ok(value) => result.value = Some(value),
                        Err(e) => result.fail(&e),
                    },
                    Some(Err(e)) => result.fail(e),
                    None => result.fail(&CipError::invalid_response("no reply for request")),
                }
            }
        }
        for (caller, err) in &plan.rejected {
            results[*caller].fail(err);
        }
        Ok(results)
    }

    /// Reads a single tag.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use logix_cip::{ClientConfig, LogixClient};
    ///
    /// let mut client = LogixClient::new(ClientConfig::new("192.168.1.10")?)?;
    /// client.open()?;
    /// let tag = client.read_tag("Program:Main.Step")?;
    /// if tag.is_ok() {
    ///     println!("{:?}", tag.value);
    /// }
    /// # Ok::<(), logix_cip::CipError>(())
    /// ```
    pub fn read_tag(&mut self, tag: &str) -> Result<Tag> {
        self.read(&[tag]).map(single)
    }

    /// Writes tags, returning one [`Tag`] per address in the same order. A
    /// successful tag carries the written value.
    ///
    /// # Errors
    ///
    /// Only communication failures are returned as `Err`.
    pub fn write(&mut self, tags: &[(&str, PlcValue)]) -> Result<Vec<Tag>> {
        let symbols = Arc::clone(&self.symbols);
        let mut results: Vec<Tag> = tags.iter().map(|(text, _)| Tag::new(text)).collect();
        let addresses = parse_all(tags.iter().map(|(text, _)| *text), &symbols, &mut results);

        let items: Vec<(usize, &TagAddress, &PlcValue)> = addresses
            .iter()
            .zip(tags)
            .enumerate()
            .filter_map(|(i, (address, (_, value)))| address.as_ref().map(|a| (i, a, value)))
            .collect();
        let plan = plan_writes(&items, &symbols, self.connection.payload_size());
        let outcomes = self.execute(&plan)?;

        for (slot, outcome) in outcomes.iter().enumerate() {
            for &caller in &plan.callers[slot] {
                let result = &mut results[caller];
                match outcome {
                    Some(Ok(_)) => result.value = Some(tags[caller].1.clone()),
                    Some(Err(e)) => result.fail(e),
                    None => result.fail(&CipError::invalid_response("no reply for request")),
                }
            }
        }
        for (caller, err) in &plan.rejected {
            results[*caller].fail(err);
        }
        Ok(results)
    }

    /// Writes a single tag.
    pub fn write_tag(&mut self, tag: &str, value: PlcValue) -> Result<Tag> {
        self.write(&[(tag, value)]).map(single)
    }

    /// Sends every request of a plan, in order, and collects one outcome per slot.
    fn execute(&mut self, plan: &Plan) -> Result<Vec<SlotOutcome>> {
        let mut outcomes: Vec<SlotOutcome> = (0..plan.slots()).map(|_| None).collect();
        for request in &plan.requests {
            match request {
                Request::Single { slot, service } => {
                    outcomes[*slot] = Some(match self.send_service(service) {
                        Ok(reply) => reply_data(&reply, service.code()),
                        Err(e) if is_fatal(&e) => return Err(e),
                        Err(e) => Err(e),
                    });
                }
                Request::MultiService(items) => {
                    let replies = match self.send_multi(items) {
                        Ok(replies) => replies,
                        Err(e) if is_fatal(&e) => return Err(e),
                        Err(e) => {
                            for (slot, _) in items {
                                outcomes[*slot] = Some(Err(copy_error(&e)));
                            }
                            continue;
                        }
                    };
                    for ((slot, service), reply) in items.iter().zip(&replies) {
                        outcomes[*slot] = Some(reply_data(reply, service.code()));
                    }
                }
                Request::FragmentedRead {
                    slot,
                    path,
                    elements,
                } => {
                    outcomes[*slot] = Some(self.read_fragmented(path, *elements)?);
                }
                Request::FragmentedWrite { slot, .. } => {
                    let mut outcome = Ok(Vec::new());
                    for service in request.write_fragments() {
                        let result = self
                            .send_service(&service)
                            .and_then(|reply| reply.check_error());
                        match result {
                            Ok(()) => {}
                            Err(e) if is_fatal(&e) => return Err(e),
                            Err(e) => {
                                outcome = Err(e);
                                break;
                            }
                        }
                    }
                    outcomes[*slot] = Some(outcome);
                }
            }
        }
        Ok(outcomes)
    }

    fn send_service(&mut self, service: &Service) -> Result<CipReply> {
        let message = service.encode()?;
        self.connection.send(&message)
    }

    fn send_multi(&mut self, items: &[(usize, Service)]) -> Result<Vec<CipReply>> {
        let messages = items
            .iter()
            .map(|(_, service)| service.encode())
            .collect::<Result<Vec<_>>>()?;
        let reply = self.connection.send(&command::multi_service(&messages)?)?;
        reply.check_service(SERVICE_MULTIPLE)?;
        let replies = multi_service_replies(&reply)?;
        if replies.len() != items.len() {
            return Err(CipError::invalid_response(format!(
                "{} replies for {} requests",
                replies.len(),
                items.len()
            )));
        }
        debug!("multi-service request answered {} services", replies.len());
        Ok(replies)
    }

    /// Runs a fragmented read to completion. The outer `Result` carries
    /// communication failures, the inner one the outcome for the tag.
    fn read_fragmented(&mut self, path: &[u8], elements: u16) -> Result<Result<Vec<u8>>> {
        let mut state = FragmentState::new();
        loop {
            let service = Service::ReadFragmented {
                path: path.to_vec(),
                elements,
                offset: state.offset,
            };
            let reply = match self.send_service(&service) {
                Ok(reply) => reply,
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => return Ok(Err(e)),
            };
            match state.accept(&reply) {
                Ok(true) => return Ok(state.into_data()),
                Ok(false) => {}
                Err(e) => return Ok(Err(e)),
            }
        }
    }
}

impl<T: Transport> Drop for LogixClient<T> {
    fn drop(&mut self) {
        if self.connection.state() != ConnectionState::Disconnected {
            if let Err(e) = self.connection.close() {
                debug!("error closing connection on drop: {e}");
            }
        }
    }
}

impl<T: Transport> std::fmt::Debug for LogixClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogixClient")
            .field("connection", &self.connection)
            .field("shared_symbols", &self.shared_symbols)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Parses every address, recording parse failures and type names in `results`.
fn parse_all<'a>(
    texts: impl Iterator<Item = &'a str>,
    symbols: &SymbolCache,
    results: &mut [Tag],
) -> Vec<Option<TagAddress>> {
    texts
        .zip(results.iter_mut())
        .map(|(text, result)| match TagAddress::parse(text, symbols) {
            Ok(address) => {
                result.type_name = Some(address.type_name.clone());
                Some(address)
            }
            Err(e) => {
                result.fail(&e);
                None
            }
        })
        .collect()
}

fn reply_data(reply: &CipReply, service: u8) -> Result<Vec<u8>> {
    reply.check_service(service)?;
    reply.check_error()?;
    Ok(reply.data.clone())
}

/// Errors that end a whole call rather than one tag.
fn is_fatal(err: &CipError) -> bool {
    err.is_communication()
        || matches!(
            err,
            CipError::NotConnected { .. } | CipError::Encapsulation { .. }
        )
}

/// Rebuilds an error for each slot of a failed batch.
fn copy_error(err: &CipError) -> CipError {
    match err {
        CipError::Status {
            status, extended, ..
        } => CipError::status(*status, *extended),
        other => CipError::invalid_response(other.to_string()),
    }
}

fn single(mut tags: Vec<Tag>) -> Tag {
    tags.pop().unwrap_or_else(|| Tag::new(""))
}
