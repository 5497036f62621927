//! Typed Pokédex client on top of the offline-first access layer.

mod api_types;
mod client;
mod types;

pub use client::{PokedexClient, PrefetchReport};
pub use types::{Pokemon, PokemonPage, PokemonRef, Species, Stat};
