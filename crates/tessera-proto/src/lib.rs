//! Wire types for the minion management channel and the daemon API.
//!
//! The wire definitions are committed directly under `src/gen/` in
//! prost/tonic generated form, client-side only, since the services
//! themselves are implemented by their respective peers (the minion
//! agent and the daemon's API layer).

pub mod minion {
    pub mod v1 {
        include!("gen/tessera.minion.v1.rs");

        pub use minion_client::MinionClient;
    }
}

pub mod api {
    pub mod v1 {
        include!("gen/tessera.api.v1.rs");

        pub use api_client::ApiClient;
    }
}
