//! Rename and copy scenarios: local, remote-only, and every
//! temporary/normal endpoint combination.
