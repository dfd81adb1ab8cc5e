//! # Logix CIP Tag Client
//!
//! A Rust library for reading and writing tags on Logix controllers using CIP
//! (Common Industrial Protocol) over EtherNet/IP.
//!
//! The library speaks the controller's own addressing: named tags, arrays,
//! bits inside integers, bit-packed BOOL arrays and members of user-defined
//! structures. The symbol table and structure templates are uploaded once and
//! cached; every read or write is then planned against that cache and packed
//! into as few requests as the connection's payload size allows.
//!
//! ## Features
//!
//! - **Tag addressing**: `Counter`, `MyArray[2]{3}`, `Grid[1,4]`,
//!   `Motor.Speed`, `Counter.7`, `Flags[40]{8}`, `Program:Main.Step`
//! - **Batching**: multi-service packets, duplicate reads folded into one
//!   request, bit writes merged into Read Modify Write masks
//! - **Fragmentation**: values larger than one packet are read and written in
//!   fragments and reassembled transparently
//! - **Structures**: recursive decoding and encoding of UDTs and Logix strings
//! - **No panics**: all errors returned as `Result<T, CipError>`
//!
//! ## Quick Start
//!
//! ```no_run
//! use logix_cip::{ClientConfig, LogixClient, PlcValue};
//!
//! fn main() -> logix_cip::Result<()> {
//!     // Controller in slot 0 of the chassis behind 192.168.1.10
//!     let config = ClientConfig::new("192.168.1.10/0")?;
//!     let mut client = LogixClient::new(config)?;
//!     client.open()?;
//!
//!     let tag = client.read_tag("MyArray[2]{3}")?;
//!     println!("{} = {:?} ({:?})", tag.tag, tag.value, tag.type_name);
//!
//!     client.write_tag("Motor.Speed", PlcValue::Real(12.5))?;
//!     client.close()
//! }
//! ```
//!
//! ## Results
//!
//! Reads and writes return one [`Tag`] per requested address. A failure that
//! concerns a single tag (an unknown name, a value of the wrong shape, a CIP
//! error status for that tag) is reported in [`Tag::error`] while the other
//! tags of the call still succeed:
//!
//! ```no_run
//! # use logix_cip::{ClientConfig, LogixClient};
//! # let mut client = LogixClient::new(ClientConfig::new("192.168.1.10").unwrap()).unwrap();
//! for tag in client.read(&["Counter", "NoSuchTag"])? {
//!     match (&tag.value, &tag.error) {
//!         (Some(value), None) => println!("{} = {:?}", tag.tag, value),
//!         (_, Some(error)) => println!("{} failed: {}", tag.tag, error),
//!         _ => {}
//!     }
//! }
//! # Ok::<(), logix_cip::CipError>(())
//! ```
//!
//! ## Error Handling
//!
//! Communication failures end the whole call and drop the connection; there is
//! no automatic reconnect.
//!
//! ```no_run
//! use logix_cip::{CipError, ClientConfig, LogixClient};
//!
//! let mut client = LogixClient::new(ClientConfig::new("192.168.1.10")?)?;
//! match client.open() {
//!     Ok(()) => println!("connected"),
//!     Err(CipError::Timeout) => println!("communication timeout"),
//!     Err(CipError::Status { status, extended, message }) => {
//!         println!("CIP error 0x{status:02X} ({extended:?}): {message}");
//!     }
//!     Err(e) => println!("error: {e}"),
//! }
//! # Ok::<(), CipError>(())
//! ```
//!
//! ## Configuration
//!
//! ```
//! use logix_cip::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::new("10.0.0.5:44818/bp/2")
//!     .unwrap()
//!     .with_timeout(Duration::from_secs(2))  // default: 5 s
//!     .with_large_packets(false)             // standard 500 byte connection
//!     .with_init_program_tags(false);        // controller-scoped tags only
//! ```
//!
//! ## Logging
//!
//! The library logs through the [`log`](https://docs.rs/log) facade and never
//! installs a logger: handshake ids, plan shapes and fragments at `debug`,
//! connection and upload summaries at `info`, fallbacks and skipped symbols at
//! `warn`.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod client;
mod codec;
pub mod command;
mod connection;
pub mod decoder;
pub mod discovery;
pub mod encoder;
mod error;
mod header;
mod path;
pub mod planner;
mod response;
pub mod symbols;
mod tag;
mod transport;
pub mod utils;

// Public re-exports
pub use client::{ClientConfig, LogixClient, Tag};
pub use codec::{ArrayIter, DataType, Layout, PlcValue, Reader};
pub use command::{multi_service, Service, TypeCode};
pub use connection::{
    Connection, ConnectionConfig, ConnectionState, MessageChannel, DEFAULT_VENDOR_ID,
};
pub use discovery::Identity;
pub use error::{encapsulation_status_description, status_description, CipError, Result};
pub use header::{EncapsulationHeader, ENCAPSULATION_HEADER_SIZE};
pub use path::{
    encode_path, object_path, parse_connection_path, port_number, ConnectionPath, LogicalKind,
    Segment, DEFAULT_PORT,
};
pub use response::{
    parse_cpf, split_multi_service, CipReply, CpfItem, STATUS_EMBEDDED_ERROR, STATUS_PARTIAL,
    STATUS_SUCCESS,
};
pub use symbols::{SymbolCache, TagInfo, TagKind, TypeTemplate};
pub use tag::{PathStep, TagAddress};
pub use transport::{TcpTransport, Transport, DEFAULT_TIMEOUT};
