//! Client and server support for the [varlink protocol](https://varlink.org),
//! built around full-duplex sessions.
//!
//! A [`Session`] multiplexes concurrent outbound calls and inbound
//! peer-initiated calls over a single NUL-framed JSON byte stream, with
//! out-of-band file descriptor passing on unix sockets. A [`Transport`]
//! pools idle sessions per URI and drives server-side dispatch on the
//! reverse direction, so both peers may call each other over the same
//! connection. A [`Server`] accepts connections and feeds calls through a
//! bounded pipeline into a [`MethodHandler`], usually a [`ServeMux`].
//!
//! # Serving
//!
//! ```rust,no_run
//! use varlink_session::{listen_and_serve, Reply, ServeMux};
//! use serde_json::json;
//!
//! let mut mux = ServeMux::new();
//! mux.handle("org.example.ping.Ping", |w: &varlink_session::ReplyWriter, call: &varlink_session::Call| {
//!     let params = call.parameters.clone().unwrap_or(json!({}));
//!     let _ = w.write_reply(Reply::new().with_parameters(params));
//! });
//! listen_and_serve("unix:@org.example.ping", mux).unwrap();
//! ```
//!
//! # Calling
//!
//! ```rust,no_run
//! use varlink_session::{Call, Client, Context};
//! use serde_json::json;
//!
//! let client = Client::default();
//! let ctx = Context::background();
//! let mut stream = client
//!     .call(&ctx, Call::new("org.example.ping.Ping").with_parameters(json!({"ping": "hi"})))
//!     .unwrap();
//! while stream.next() {
//!     println!("{}", stream.reply().parameters);
//! }
//! assert!(stream.error().is_none());
//! ```

use std::fmt;
use std::os::unix::io::RawFd;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub mod error;
pub use error::{Error, ErrorKind, Result};

mod fdpass;
mod mux;
mod server;
mod session;
mod stream;
mod sync;
mod transport;

pub use crate::fdpass::{UnixConn, SCM_MAX_FD};
pub use crate::mux::{ServeMux, ServiceInfo};
pub use crate::server::{listen_and_serve, MethodHandler, ReplyWriter, Server, ServerBuilder};
pub use crate::session::{CallHandle, Session};
pub use crate::stream::{Listener, Stream};
pub use crate::sync::{Cause, Context};
pub use crate::transport::{Client, ReplyStream, Transport, TransportBuilder};

#[cfg(test)]
mod test;

/// A varlink address: `<scheme>:<address>[;<properties>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub scheme: String,
    pub address: String,
}

impl Uri {
    /// Parses a varlink URI. Anything after a `;` is "properties",
    /// reserved for future extensions and ignored.
    pub fn parse(uri: &str) -> Result<Uri> {
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| context!(ErrorKind::InvalidAddress))?;
        let address = rest.split(';').next().unwrap_or(rest);
        Ok(Uri {
            scheme: scheme.to_string(),
            address: address.to_string(),
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.address)
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Uri> {
        Uri::parse(s)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A varlink method call.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct Call {
    /// The URI to make the call to. When unset, the transport derives
    /// `unix:@<interface>` from the method name.
    #[serde(skip)]
    pub uri: Option<Uri>,

    /// Fully qualified method name, in the format `<interface>.<method>`.
    pub method: String,

    /// Instructs the server to suppress its reply. The server must adhere
    /// to the instruction, to allow clients to associate the next reply to
    /// the next call issued without oneway.
    #[serde(default, skip_serializing_if = "is_false")]
    pub oneway: bool,

    /// Requests possible multiple replies to the same call.
    #[serde(default, skip_serializing_if = "is_false")]
    pub more: bool,

    /// Requests the connection to be taken over by a custom
    /// protocol/payload.
    #[serde(default, skip_serializing_if = "is_false")]
    pub upgrade: bool,

    /// Input parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,

    /// Open file descriptors sent or received with the call.
    #[serde(skip)]
    pub file_descriptors: Vec<RawFd>,
}

impl Call {
    pub fn new<S: Into<String>>(method: S) -> Call {
        Call {
            method: method.into(),
            ..Call::default()
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Call {
        self.parameters = Some(parameters);
        self
    }

    /// Instructs the server to suppress its reply.
    pub fn with_oneway(mut self) -> Call {
        self.oneway = true;
        self
    }

    /// Requests possible multiple replies to the same call.
    pub fn with_more(mut self) -> Call {
        self.more = true;
        self
    }

    /// Requests the connection to be taken over by a custom payload.
    pub fn with_upgrade(mut self) -> Call {
        self.upgrade = true;
        self
    }

    pub fn with_uri(mut self, uri: Uri) -> Call {
        self.uri = Some(uri);
        self
    }

    /// Attaches a file descriptor to be sent with the call.
    pub fn with_fd(mut self, fd: RawFd) -> Call {
        self.file_descriptors.push(fd);
        self
    }

    /// Deserializes the call parameters, mapping unknown fields and type
    /// mismatches to `org.varlink.service.InvalidParameter`.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> std::result::Result<T, VarlinkError> {
        decode_params(self.parameters.as_ref())
    }
}

/// A varlink method reply.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Reply {
    /// Output parameters. Never omitted on the wire, even when logically
    /// empty; many peers reject a reply without the field.
    #[serde(default = "empty_object")]
    pub parameters: Value,

    /// Instructs the client to expect multiple replies.
    #[serde(default, skip_serializing_if = "is_false")]
    pub continues: bool,

    /// The fully-qualified reverse-domain error name. Set when the method
    /// call has failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Open file descriptors sent or received with the reply.
    #[serde(skip)]
    pub file_descriptors: Vec<RawFd>,
}

impl Default for Reply {
    fn default() -> Reply {
        Reply {
            parameters: empty_object(),
            continues: false,
            error: None,
            file_descriptors: Vec::new(),
        }
    }
}

impl Reply {
    pub fn new() -> Reply {
        Reply::default()
    }

    pub fn with_parameters(mut self, parameters: Value) -> Reply {
        self.parameters = parameters;
        self
    }

    /// Signifies that more replies follow this one. Must only be set if
    /// the call set the `more` option.
    pub fn with_continues(mut self) -> Reply {
        self.continues = true;
        self
    }

    /// Turns the reply into an error reply with the specified
    /// fully-qualified error code.
    pub fn with_error<S: Into<String>>(mut self, code: S) -> Reply {
        self.error = Some(code.into());
        self
    }

    /// Attaches a file descriptor to be sent with the reply.
    pub fn with_fd(mut self, fd: RawFd) -> Reply {
        self.file_descriptors.push(fd);
        self
    }

    pub fn unmarshal<T: DeserializeOwned>(&self) -> std::result::Result<T, VarlinkError> {
        decode_params(Some(&self.parameters))
    }
}

impl From<&VarlinkError> for Reply {
    fn from(err: &VarlinkError) -> Reply {
        Reply {
            parameters: err.parameters().cloned().unwrap_or_else(empty_object),
            continues: false,
            error: Some(err.code().to_string()),
            file_descriptors: Vec::new(),
        }
    }
}

/// A varlink protocol error: a fully qualified error code plus a JSON
/// parameter object. Distinct from a transport failure.
#[derive(Debug, Clone, PartialEq)]
pub struct VarlinkError {
    code: String,
    parameters: Option<Value>,
}

impl VarlinkError {
    pub fn new<S: Into<String>>(code: S, parameters: Option<Value>) -> VarlinkError {
        VarlinkError {
            code: code.into(),
            parameters,
        }
    }

    /// The fully-qualified reverse-domain error name.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn parameters(&self) -> Option<&Value> {
        self.parameters.as_ref()
    }

    /// Deserializes the error parameters into a typed value.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> std::result::Result<T, VarlinkError> {
        decode_params(self.parameters.as_ref())
    }

    pub fn interface_not_found(interface: &str) -> VarlinkError {
        VarlinkError::new(
            "org.varlink.service.InterfaceNotFound",
            Some(json!({ "interface": interface })),
        )
    }

    pub fn method_not_found(method: &str) -> VarlinkError {
        VarlinkError::new(
            "org.varlink.service.MethodNotFound",
            Some(json!({ "method": method })),
        )
    }

    pub fn method_not_implemented(method: &str) -> VarlinkError {
        VarlinkError::new(
            "org.varlink.service.MethodNotImplemented",
            Some(json!({ "method": method })),
        )
    }

    pub fn invalid_parameter(parameter: &str) -> VarlinkError {
        VarlinkError::new(
            "org.varlink.service.InvalidParameter",
            Some(json!({ "parameter": parameter })),
        )
    }
}

impl fmt::Display for VarlinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

impl std::error::Error for VarlinkError {}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
struct ErrorParameterField {
    #[serde(default)]
    parameter: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
struct ErrorMethodField {
    #[serde(default)]
    method: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
struct ErrorInterfaceField {
    #[serde(default)]
    interface: Option<String>,
}

impl ErrorKind {
    /// Lifts an error reply into a typed kind. The standard
    /// `org.varlink.service` errors get their own kinds; everything else
    /// becomes [`ErrorKind::VarlinkErrorReply`].
    pub fn from_reply(reply: &Reply) -> ErrorKind {
        let code = match &reply.error {
            Some(code) => code.as_str(),
            None => return ErrorKind::VarlinkErrorReply(VarlinkError::new("", None)),
        };
        let params = Some(&reply.parameters);
        match code {
            "org.varlink.service.InterfaceNotFound" => ErrorKind::InterfaceNotFound(
                decode_params::<ErrorInterfaceField>(params)
                    .map(|v| v.interface.unwrap_or_default())
                    .unwrap_or_default(),
            ),
            "org.varlink.service.InvalidParameter" => ErrorKind::InvalidParameter(
                decode_params::<ErrorParameterField>(params)
                    .map(|v| v.parameter.unwrap_or_default())
                    .unwrap_or_default(),
            ),
            "org.varlink.service.MethodNotFound" => ErrorKind::MethodNotFound(
                decode_params::<ErrorMethodField>(params)
                    .map(|v| v.method.unwrap_or_default())
                    .unwrap_or_default(),
            ),
            "org.varlink.service.MethodNotImplemented" => ErrorKind::MethodNotImplemented(
                decode_params::<ErrorMethodField>(params)
                    .map(|v| v.method.unwrap_or_default())
                    .unwrap_or_default(),
            ),
            _ => ErrorKind::VarlinkErrorReply(VarlinkError::new(
                code,
                Some(reply.parameters.clone()),
            )),
        }
    }
}

/// Deserializes a parameter object into a typed value. Unknown fields,
/// missing fields and type mismatches map to
/// `org.varlink.service.InvalidParameter` naming the offending field;
/// failures without a field path surface as a generic unmarshal error
/// naming the target type.
pub fn decode_params<T: DeserializeOwned>(
    parameters: Option<&Value>,
) -> std::result::Result<T, VarlinkError> {
    let value = parameters.cloned().unwrap_or_else(empty_object);
    serde_path_to_error::deserialize(value).map_err(|e| {
        let path = e.path().to_string();
        let msg = e.into_inner().to_string();
        // serde_json reports field identities only through its message
        // strings, much like encoding/json.
        if let Some(rest) = msg.strip_prefix("unknown field `") {
            if let Some(end) = rest.find('`') {
                return VarlinkError::invalid_parameter(&rest[..end]);
            }
        }
        if let Some(rest) = msg.strip_prefix("missing field `") {
            if let Some(end) = rest.find('`') {
                return VarlinkError::invalid_parameter(&rest[..end]);
            }
        }
        // Type mismatches carry the path of the field that failed.
        if !path.is_empty() && path != "." {
            return VarlinkError::invalid_parameter(&path);
        }
        VarlinkError::new(
            "io.varlink.session.UnmarshalError",
            Some(json!({
                "type": std::any::type_name::<T>(),
                "message": msg,
            })),
        )
    })
}
