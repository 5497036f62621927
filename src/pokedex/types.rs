/// Full Pokémon details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pokemon {
  pub id: u32,
  pub name: String,
  /// Decimetres
  pub height: u32,
  /// Hectograms
  pub weight: u32,
  pub base_experience: Option<u32>,
  /// Type names in slot order
  pub types: Vec<String>,
  /// Non-hidden abilities
  pub abilities: Vec<String>,
  pub stats: Vec<Stat>,
  pub sprite: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
  pub name: String,
  pub base: u32,
}

/// One page of the Pokémon index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PokemonPage {
  /// Total number of Pokémon in the index
  pub count: u32,
  pub next_offset: Option<u32>,
  pub previous_offset: Option<u32>,
  pub entries: Vec<PokemonRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PokemonRef {
  pub id: Option<u32>,
  pub name: String,
}

/// Species details (English texts only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Species {
  pub id: u32,
  pub name: String,
  pub genus: Option<String>,
  pub flavor_text: Option<String>,
  pub generation: Option<String>,
  pub is_legendary: bool,
  pub is_mythical: bool,
  pub capture_rate: Option<u32>,
}
