//! Python bindings for the trafix traffic simulation framework
//!
//! This crate provides PyO3 bindings to expose trafix-core functionality
//! to Python. The GIL is released around every call that drives the
//! simulation, so observer threads keep running while an episode steps.

use pyo3::prelude::*;

mod bindings;

use bindings::*;

/// The trafix Python module
#[pymodule]
fn _trafix(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Initialize tracing for debugging
    let _ = tracing_subscriber::fmt::try_init();

    // Version info
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add("VERSION", trafix_core::VERSION)?;

    // Scenario building
    m.add_class::<PyScenario>()?;

    // Backend configuration
    m.add_class::<PySimConfig>()?;
    m.add_class::<PyRemoteConfig>()?;

    // Environment driver
    m.add_class::<PyTrafficEnv>()?;
    m.add_class::<PyEpisodeReport>()?;

    Ok(())
}
