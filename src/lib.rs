//! LAN file sharing node: peers announce themselves over UDP broadcast and
//! pull files from each other over a plain TCP request/stream protocol.

pub mod config;
pub mod networking;
pub mod node;
