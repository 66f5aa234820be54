/// Protocol strategies plugged into the shared handler
pub mod galera;
pub mod redis;
pub mod tcp;
