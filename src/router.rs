//! Some known public DHT routers.

pub const LIBTORRENT_DHT: &str = "dht.libtorrent.org:25401";
pub const BITTORRENT_DHT: &str = "router.bittorrent.com:6881";

/// Routers used to seed health lookups unless configured otherwise.
pub const DEFAULT_ROUTERS: [&str; 2] = [LIBTORRENT_DHT, BITTORRENT_DHT];
