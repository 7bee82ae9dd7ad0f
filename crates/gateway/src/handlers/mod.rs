//! API handlers module

pub mod chat;
pub mod feedback;
pub mod health;
