//! End-to-end scenarios across several contexts
//!
//! Background, popup and tab contexts share one hub; every engine runs
//! its own receive and flush loops.
