pub(crate) mod dest;
mod server;

pub(crate) use server::{ServerHandle, spawn};
