//! Request-queue behavior: one entry per path, replacement on later
//! writes, and the transfer decision table for every endpoint
//! classification.
