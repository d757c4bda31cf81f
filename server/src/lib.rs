//! `severity-server`: HTTP front end for crash severity predictions.
//!
//! Routes:
//! - `GET /` home page with the prediction form
//! - `POST /predict` JSON crash record in, `{prediction, confidence}` out
//! - `GET /health` ready / degraded
//!
//! Every failure is answered with a JSON body; see [`http::ApiError`].

pub mod http;
pub mod logging;

pub use http::{AppState, router, serve};
