//! Link registry
//!
//! Owns the per-link state for every open port. Replaces any notion of
//! global per-port tables: callers get a handle at open time and everything
//! they do goes through it.

use std::sync::{Arc, Mutex};

use super::error::LinkError;
use super::net::{LinkConfig, LinkHandle, NetRate};
use super::serial::open_port;

/// Maximum simultaneously open links
pub const LINKS_MAX: usize = 3;

/// Registry of open Meridian links
pub struct LinkRegistry {
    links: Mutex<Vec<Arc<LinkHandle>>>,
}

impl LinkRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            links: Mutex::new(Vec::new()),
        }
    }

    /// Open the serial port named in `config`, bring the link up, and
    /// register it
    pub fn open(&self, config: LinkConfig) -> Result<Arc<LinkHandle>, LinkError> {
        {
            let links = self.links.lock().unwrap();
            if links.len() >= LINKS_MAX {
                return Err(LinkError::Serial(format!(
                    "link limit reached ({LINKS_MAX})"
                )));
            }
        }
        // Bring-up drops to the base rate anyway; open there directly
        let port = open_port(&config.port_name, NetRate::Baud9600.bps())?;
        let handle = Arc::new(LinkHandle::open_with_transport(Box::new(port), config)?);
        self.links.lock().unwrap().push(Arc::clone(&handle));
        Ok(handle)
    }

    /// Close `handle` and drop it from the registry
    pub fn close(&self, handle: &Arc<LinkHandle>) {
        handle.close();
        self.links
            .lock()
            .unwrap()
            .retain(|h| !Arc::ptr_eq(h, handle));
    }

    /// Close every open link
    pub fn close_all(&self) {
        let links = std::mem::take(&mut *self.links.lock().unwrap());
        for handle in links {
            handle.close();
        }
    }

    /// Number of links currently open
    pub fn open_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LinkRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
