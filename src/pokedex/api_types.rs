//! Serde-deserializable types matching Pokédex API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;

use super::types::{Pokemon, PokemonPage, PokemonRef, Species, Stat};

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiNamedResource {
  pub name: String,
  #[serde(default)]
  pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiLanguage {
  pub name: String,
}

// ============================================================================
// pokemon/{id}
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiTypeSlot {
  pub slot: u32,
  #[serde(rename = "type")]
  pub kind: ApiNamedResource,
}

#[derive(Debug, Deserialize)]
pub struct ApiAbilitySlot {
  pub ability: ApiNamedResource,
  #[serde(default)]
  pub is_hidden: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApiStat {
  pub base_stat: u32,
  pub stat: ApiNamedResource,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiSprites {
  pub front_default: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPokemon {
  pub id: u32,
  pub name: String,
  #[serde(default)]
  pub height: u32,
  #[serde(default)]
  pub weight: u32,
  pub base_experience: Option<u32>,
  #[serde(default)]
  pub types: Vec<ApiTypeSlot>,
  #[serde(default)]
  pub abilities: Vec<ApiAbilitySlot>,
  #[serde(default)]
  pub stats: Vec<ApiStat>,
  #[serde(default)]
  pub sprites: ApiSprites,
}

impl From<ApiPokemon> for Pokemon {
  fn from(api: ApiPokemon) -> Self {
    let mut types = api.types;
    types.sort_by_key(|slot| slot.slot);

    Pokemon {
      id: api.id,
      name: api.name,
      height: api.height,
      weight: api.weight,
      base_experience: api.base_experience,
      types: types.into_iter().map(|slot| slot.kind.name).collect(),
      abilities: api
        .abilities
        .into_iter()
        .filter(|slot| !slot.is_hidden)
        .map(|slot| slot.ability.name)
        .collect(),
      stats: api
        .stats
        .into_iter()
        .map(|s| Stat {
          name: s.stat.name,
          base: s.base_stat,
        })
        .collect(),
      sprite: api.sprites.front_default,
    }
  }
}

// ============================================================================
// pokemon?limit=&offset=
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiPokemonPage {
  pub count: u32,
  pub next: Option<String>,
  pub previous: Option<String>,
  #[serde(default)]
  pub results: Vec<ApiNamedResource>,
}

impl From<ApiPokemonPage> for PokemonPage {
  fn from(api: ApiPokemonPage) -> Self {
    PokemonPage {
      count: api.count,
      next_offset: api.next.as_deref().and_then(offset_of),
      previous_offset: api.previous.as_deref().and_then(offset_of),
      entries: api
        .results
        .into_iter()
        .map(|r| PokemonRef {
          id: id_from_url(&r.url),
          name: r.name,
        })
        .collect(),
    }
  }
}

// ============================================================================
// pokemon-species/{id}
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiFlavorText {
  pub flavor_text: String,
  pub language: ApiLanguage,
}

#[derive(Debug, Deserialize)]
pub struct ApiGenus {
  pub genus: String,
  pub language: ApiLanguage,
}

#[derive(Debug, Deserialize)]
pub struct ApiSpecies {
  pub id: u32,
  pub name: String,
  #[serde(default)]
  pub is_legendary: bool,
  #[serde(default)]
  pub is_mythical: bool,
  pub capture_rate: Option<u32>,
  pub generation: Option<ApiNamedResource>,
  #[serde(default)]
  pub genera: Vec<ApiGenus>,
  #[serde(default)]
  pub flavor_text_entries: Vec<ApiFlavorText>,
}

impl From<ApiSpecies> for Species {
  fn from(api: ApiSpecies) -> Self {
    let genus = api
      .genera
      .into_iter()
      .find(|g| g.language.name == "en")
      .map(|g| g.genus);
    let flavor_text = api
      .flavor_text_entries
      .into_iter()
      .find(|f| f.language.name == "en")
      .map(|f| clean_flavor_text(&f.flavor_text));

    Species {
      id: api.id,
      name: api.name,
      genus,
      flavor_text,
      generation: api.generation.map(|g| g.name),
      is_legendary: api.is_legendary,
      is_mythical: api.is_mythical,
      capture_rate: api.capture_rate,
    }
  }
}

/// Flavor text is stored with hard line breaks and form feeds.
fn clean_flavor_text(raw: &str) -> String {
  raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Numeric id from a resource URL such as `.../pokemon/25/`.
fn id_from_url(url: &str) -> Option<u32> {
  url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// `offset` query parameter of a page URL.
fn offset_of(page_url: &str) -> Option<u32> {
  let url = url::Url::parse(page_url).ok()?;
  url
    .query_pairs()
    .find(|(key, _)| key == "offset")
    .and_then(|(_, value)| value.parse().ok())
}
