// ABOUTME: Target repository service collaborator
// ABOUTME: Project lookup, credential validation and push URL construction

pub mod client;
pub mod models;

pub use client::{authenticated_url, RemoteClient, TargetService};
pub use models::{TargetProject, TargetUser};
