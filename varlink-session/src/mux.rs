//! Pattern-matched routing of method names to handlers, plus the
//! `org.varlink.service` introspection endpoints.

use std::collections::{BTreeMap, HashMap};

use serde_derive::{Deserialize, Serialize};

use crate::server::{MethodHandler, ReplyWriter};
use crate::{Call, VarlinkError};

const SERVICE_INTERFACE: &str = "org.varlink.service";

const SERVICE_DESCRIPTION: &str = r#"# The Varlink Service Interface is provided by every varlink service. It
# describes the service and the interfaces it implements.
interface org.varlink.service

# Get a list of all the interfaces a service provides and information
# about the implementation.
method GetInfo() -> (
  vendor: string,
  product: string,
  version: string,
  url: string,
  interfaces: []string
)

# Get the description of an interface that is implemented by this service.
method GetInterfaceDescription(interface: string) -> (description: string)

# The requested interface was not found.
error InterfaceNotFound (interface: string)

# The requested method was not found
error MethodNotFound (method: string)

# The interface defines the requested method, but the service does not
# implement it.
error MethodNotImplemented (method: string)

# One of the passed parameters is invalid.
error InvalidParameter (parameter: string)
"#;

/// Service information returned by `org.varlink.service.GetInfo`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct ServiceInfo {
    pub vendor: String,
    pub product: String,
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GetInterfaceDescriptionArgs {
    interface: String,
}

#[derive(Serialize)]
struct GetInterfaceDescriptionReply {
    description: String,
}

/// Routes fully-qualified method names to handlers through an ordered
/// list of shell-glob patterns, and answers the two introspection
/// methods from registered interface descriptions.
#[derive(Default)]
pub struct ServeMux {
    patterns: Vec<(String, glob::Pattern)>,
    handlers: HashMap<String, Box<dyn MethodHandler>>,
    descriptions: BTreeMap<String, String>,
    info: ServiceInfo,
}

impl ServeMux {
    pub fn new() -> ServeMux {
        ServeMux::default()
    }

    /// Registers a handler for every method name matching `pattern`.
    /// Patterns resolve in sorted order.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is not a valid glob.
    pub fn handle<H: MethodHandler + 'static>(&mut self, pattern: &str, handler: H) {
        let compiled = match glob::Pattern::new(pattern) {
            Ok(compiled) => compiled,
            Err(e) => panic!("invalid method pattern {:?}: {}", pattern, e),
        };
        self.patterns.push((pattern.to_string(), compiled));
        self.patterns.sort_by(|a, b| a.0.cmp(&b.0));
        let _ = self.handlers.insert(pattern.to_string(), Box::new(handler));
    }

    /// Sets the varlink service description for the specified interface
    /// name, making it available through introspection.
    ///
    /// # Panics
    ///
    /// Panics if the description is not valid varlink IDL.
    pub fn set_description(&mut self, interface: &str, description: &str) {
        if let Err(e) = varlink_idl::parse(description) {
            panic!(
                "description for {:?} isn't written in the varlink IDL: {}",
                interface, e
            );
        }
        let _ = self
            .descriptions
            .insert(interface.to_string(), description.to_string());
    }

    /// Overrides the service information returned by introspection.
    /// Empty fields fall back to defaults derived from this crate's
    /// package metadata.
    pub fn set_info(&mut self, vendor: &str, product: &str, version: &str, url: &str) {
        self.info = ServiceInfo {
            vendor: vendor.to_string(),
            product: product.to_string(),
            version: version.to_string(),
            url: url.to_string(),
            interfaces: Vec::new(),
        };
    }

    fn get_info(&self, w: &ReplyWriter) {
        let mut info = self.info.clone();

        let mut interfaces = Vec::with_capacity(self.descriptions.len() + 1);
        interfaces.push(SERVICE_INTERFACE.to_string());
        interfaces.extend(self.descriptions.keys().cloned());
        interfaces.sort();
        interfaces.dedup();
        info.interfaces = interfaces;

        if info.vendor.is_empty() {
            info.vendor = env!("CARGO_PKG_NAME").to_string();
        }
        if info.product.is_empty() {
            info.product = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).to_string();
        }
        if info.version.is_empty() {
            info.version = env!("CARGO_PKG_VERSION").to_string();
        }
        if info.url.is_empty() {
            info.url = "https://varlink.org".to_string();
        }

        let _ = w.write_parameters(&info);
    }

    fn get_interface_description(&self, w: &ReplyWriter, call: &Call) {
        let args: GetInterfaceDescriptionArgs = match call.unmarshal() {
            Ok(args) => args,
            Err(err) => {
                let _ = w.write_error(err);
                return;
            }
        };

        let description = if args.interface == SERVICE_INTERFACE {
            SERVICE_DESCRIPTION
        } else {
            match self.descriptions.get(&args.interface) {
                Some(description) => description,
                None => {
                    let _ = w.write_error(VarlinkError::interface_not_found(&args.interface));
                    return;
                }
            }
        };

        let _ = w.write_parameters(&GetInterfaceDescriptionReply {
            description: description.to_string(),
        });
    }
}

impl MethodHandler for ServeMux {
    fn serve_method(&self, w: &ReplyWriter, call: &Call) {
        match call.method.as_str() {
            "org.varlink.service.GetInfo" => return self.get_info(w),
            "org.varlink.service.GetInterfaceDescription" => {
                return self.get_interface_description(w, call)
            }
            _ => {}
        }

        for (pattern, compiled) in &self.patterns {
            if compiled.matches(&call.method) {
                return self.handlers[pattern].serve_method(w, call);
            }
        }
        let _ = w.write_error(VarlinkError::method_not_found(&call.method));
    }
}
