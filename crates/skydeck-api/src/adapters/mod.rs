// Concrete service adapters.
//
// One module per service family. Each adapter is a zero-sized strategy
// object looked up through `adapter::adapter_for`.

pub mod arr;
pub mod jellyfin;
pub mod plex;
pub mod qbittorrent;
