//! Concrete transports and subprocess drivers consumed by the pipelines:
//! SFTP over ssh2, workshop metadata over HTTP, RCON, the steamcmd
//! downloader, and the shared secret-redaction helpers.

pub mod rcon;
pub mod redact;
pub mod sftp;
pub mod steamcmd;
pub mod workshop;
