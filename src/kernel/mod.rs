//! Typed bindings to the compute kernels.
//!
//! The denoisers talk to their kernels through the small opaque surfaces in
//! these modules: the spectral kernel is the statically-linked RNNoise
//! implementation, the neural kernel is a tract-driven magnitude-mask model.

pub mod neural;
pub mod spectral;
