//! Peripheral chip drivers.
//!
//! This module contains drivers for the board management ICs on the fanout
//! board. All drivers are generic over the hw_trait interfaces.

pub mod pca9555;
