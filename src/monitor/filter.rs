//! Filter compilation and installation.
//!
//! A new expression is always compiled first and installed only once the
//! compile succeeded, so a bad expression never disturbs the filter already
//! running on the handle. The compiled program of the active filter lives in
//! a single slot; replacing it drops (and so releases) the old program exactly
//! once.

use crate::error::FilterError;
use crate::logger::{Event, SharedLogger};
use crate::monitor::source::{CaptureBackend, CaptureHandle};
use crate::monitor::types::Netmask;

struct InstalledFilter<P> {
    expression: String,
    // Held only to keep the program alive while it is the active filter.
    _program:   P,
}

/// Compiles filter expressions against one resolved netmask and installs
/// them on a capture handle.
pub struct FilterCompiler<P> {
    netmask:   Netmask,
    optimize:  bool,
    installed: Option<InstalledFilter<P>>,
}

impl<P> FilterCompiler<P> {
    pub fn new(netmask: Netmask, optimize: bool) -> Self {
        Self { netmask, optimize, installed: None }
    }

    /// Expression of the filter last installed successfully.
    pub fn current(&self) -> Option<&str> {
        self.installed.as_ref().map(|f| f.expression.as_str())
    }

    /// Compiles `expression` and, if that succeeds, installs it on `handle`.
    ///
    /// On any failure the previously installed filter and its program stay in
    /// place.
    pub fn compile<H>(&mut self, handle: &mut H, expression: &str) -> Result<(), FilterError>
    where
        H: CaptureHandle<Program = P>,
    {
        let program = handle
            .compile(expression, self.netmask, self.optimize)
            .map_err(|reason| FilterError::Compile {
                expression: expression.to_string(),
                reason,
            })?;

        handle
            .install(expression, &program, self.optimize)
            .map_err(|reason| FilterError::Install {
                expression: expression.to_string(),
                reason,
            })?;

        self.installed = Some(InstalledFilter {
            expression: expression.to_string(),
            _program:   program,
        });
        Ok(())
    }
}

/// Looks up the interface netmask. A failed lookup is logged and falls back
/// to 0.0.0.0 for both network and mask; it never stops the capture.
pub fn resolve_netmask<B: CaptureBackend>(
    backend:   &B,
    interface: &str,
    logger:    &SharedLogger,
) -> Netmask {
    match backend.netmask(interface) {
        Ok(netmask) => netmask,
        Err(error) => {
            logger.log(&Event::NetmaskFallback { iface: interface, error: &error });
            Netmask::default()
        }
    }
}
