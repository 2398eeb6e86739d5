//! Integration tests against the simulated device transport

mod test_installer;
mod test_phase;
mod test_upgrade;
