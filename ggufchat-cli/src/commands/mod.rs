//! Commands run by the ggufchat binary.

pub mod replay;
