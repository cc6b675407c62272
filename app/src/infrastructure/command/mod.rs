mod scp;
mod ssh_proxy;

pub use self::ssh_proxy::Transport;
