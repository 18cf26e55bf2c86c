//! # LabelPrint Service
//!
//! Turns label requests into printed QR labels on a serial label printer.
//! Requests arrive as JSON lines; each asks for a number of labels tagged
//! with a request id and the requester's name.

pub mod config;
pub mod handler;
pub mod lookup;
pub mod render;

pub use config::ServiceConfig;
pub use handler::{HandlerError, LabelHandler, PrintRequest};
pub use lookup::{FallbackLookup, LookupError, MapLookup, NameLookup};
pub use render::{LabelRenderer, QrLabelRenderer, RenderError};
