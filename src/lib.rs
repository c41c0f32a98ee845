pub mod bdoc;
pub mod btree;
pub mod engine;
pub mod error;
pub mod exec;
pub mod jql;
pub mod json;
pub mod kv;
pub mod meta;
pub mod node;
pub mod patch;
pub mod pointer;

pub use bdoc::{Bdoc, BdocView, Kind};
pub use engine::{DbOpts, LogCallback, OpalDb};
pub use error::{Error, Result};
pub use exec::{ExecDoc, Step};
pub use jql::Query;
pub use json::PrintFlags;
pub use meta::{IndexMode, IDX_F64, IDX_I64, IDX_STR, IDX_UNIQUE};
pub use node::JsonNode;
pub use pointer::Pointer;
