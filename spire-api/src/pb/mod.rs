//! Generated protobuf bindings for SPIRE APIs.
//!
//! **This module contains generated code. Do not edit these files manually.**
//!
//! The bindings are produced by `build.rs` from the schemas under `proto/`.
//!
//! ## Lint Suppressions
//!
//! The following lint suppressions are applied to this module because the generated code
//! from `prost`/`tonic-prost-build` does not always conform to our linting standards:
//!
//! - `clippy::all` and `clippy::pedantic`: Generated code may not follow all clippy rules
//! - `missing_docs`: Generated types may lack documentation
//! - `dead_code`: The server half is only exercised by tests
#![allow(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(missing_docs)]
#![allow(dead_code)]

pub mod spire {
    pub mod api {
        pub mod server {
            pub mod bundle {
                pub mod v1 {
                    tonic::include_proto!("spire.api.server.bundle.v1");
                }
            }
        }

        pub mod types {
            tonic::include_proto!("spire.api.types");
        }
    }
}
