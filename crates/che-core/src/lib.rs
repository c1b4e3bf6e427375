//! # che-core
//!
//! Foundation types shared by every crate of the dashboard client:
//!
//! - **Branded IDs**: `WorkspaceId`, `OrganizationId`, `UserId`, `ClientId`
//!   as string newtypes so a workspace id is never passed where a user id is
//!   expected
//! - **Wire errors**: [`errors::RpcErrorPayload`], the `{number, message,
//!   data}` body carried by JSON-RPC error responses
//! - **Logging**: `tracing` subscriber setup and an in-memory capture layer
//!   for tests

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
