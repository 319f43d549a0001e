//! Primitives for synchronization between real-time synthesis threads.
//!
//! This crate provides the mechanisms whereby a synthesis thread can communicate with other threads without ever
//! entering the kernel or blocking for an unbounded amount of time.  General-purpose synchronization primitives
//! optimize for memory usage or average throughput, but the important feature for a hard-real-time sample pipeline is
//! that neither side of a communication is ever suspended by the other.  Everything here either completes in a bounded
//! number of instructions or spins with a CPU-yield hint under the caller's control.

pub mod spin;
pub mod spsc_ring;
