//! Fetch coordination under concurrency: one download per path, and no
//! observer ever sees a partially downloaded file.
