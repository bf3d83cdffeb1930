#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

pub mod proto {
    #![allow(clippy::doc_markdown)]

    tonic::include_proto!("querygate");

    /// Encoded file descriptor set for the `querygate` package, used to serve
    /// gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("querygate_descriptor");
}
