use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::api::{ApiHelper, ApiResponse, GetOptions};
use crate::error::ApiError;
use crate::queue::{ItemOptions, Priority, QueueConfig, QueueManager};

use super::api_types::{ApiPokemon, ApiPokemonPage, ApiSpecies};
use super::types::{Pokemon, PokemonPage, Species};

/// Outcome of a bulk prefetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
  pub requested: usize,
  pub succeeded: usize,
  pub failed: usize,
}

/// Pokédex API client.
///
/// Every call goes through [`ApiHelper`], so results come from the network or
/// the cache depending on connectivity, and failures are reported in the
/// response instead of as errors.
#[derive(Clone)]
pub struct PokedexClient {
  api: ApiHelper,
  base_url: String,
  timeout: Duration,
  prefetch: QueueManager<String>,
}

impl PokedexClient {
  pub fn new(api: ApiHelper, base_url: &str, timeout: Duration, prefetch: QueueConfig) -> Self {
    Self {
      api,
      base_url: base_url.trim_end_matches('/').to_string(),
      timeout,
      prefetch: QueueManager::new("prefetch", prefetch),
    }
  }

  pub fn api(&self) -> &ApiHelper {
    &self.api
  }

  pub fn pokemon_endpoint(&self, id_or_name: &str) -> String {
    format!("{}/pokemon/{}", self.base_url, normalize(id_or_name))
  }

  pub fn page_endpoint(&self, limit: u32, offset: u32) -> String {
    format!("{}/pokemon?limit={}&offset={}", self.base_url, limit, offset)
  }

  pub fn species_endpoint(&self, id_or_name: &str) -> String {
    format!("{}/pokemon-species/{}", self.base_url, normalize(id_or_name))
  }

  fn options(&self, force_refresh: bool, priority: Priority) -> GetOptions {
    GetOptions {
      force_refresh,
      timeout: self.timeout,
      priority,
      ..GetOptions::default()
    }
  }

  /// Get a single Pokémon by id or name.
  pub async fn pokemon(&self, id_or_name: &str, force_refresh: bool) -> ApiResponse<Pokemon> {
    let endpoint = self.pokemon_endpoint(id_or_name);
    self
      .api
      .get(&endpoint, parse_pokemon, self.options(force_refresh, Priority::High))
      .await
  }

  /// Get one page of the Pokémon index.
  pub async fn list(&self, limit: u32, offset: u32, force_refresh: bool) -> ApiResponse<PokemonPage> {
    let endpoint = self.page_endpoint(limit, offset);
    self
      .api
      .get(&endpoint, parse_page, self.options(force_refresh, Priority::Normal))
      .await
  }

  /// Get species details by id or name.
  pub async fn species(&self, id_or_name: &str, force_refresh: bool) -> ApiResponse<Species> {
    let endpoint = self.species_endpoint(id_or_name);
    self
      .api
      .get(&endpoint, parse_species, self.options(force_refresh, Priority::Normal))
      .await
  }

  /// Warm the cache for several Pokémon at once through the prefetch queue.
  pub async fn prefetch<I, S>(&self, ids_or_names: I, priority: Priority) -> Result<PrefetchReport, ApiError>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let endpoints: Vec<String> = ids_or_names
      .into_iter()
      .map(|id| self.pokemon_endpoint(id.as_ref()))
      .collect();
    let requested = endpoints.len();
    self.prefetch.enqueue_all(endpoints, ItemOptions::from(priority))?;

    let api = self.api.clone();
    let options = self.options(false, Priority::Low);
    let succeeded = self
      .prefetch
      .process(move |endpoint: String| {
        let api = api.clone();
        let options = options.clone();
        async move {
          debug!(endpoint = %endpoint, "prefetching");
          api
            .get(&endpoint, |value: Value| Ok(value), options)
            .await
            .into_result()
            .map(|_| ())
        }
      })
      .await;

    let report = PrefetchReport {
      requested,
      succeeded,
      failed: requested.saturating_sub(succeeded),
    };
    info!(requested, succeeded, "prefetch finished");
    Ok(report)
  }
}

fn normalize(id_or_name: &str) -> String {
  id_or_name.trim().to_lowercase().replace(' ', "-")
}

fn parse_pokemon(value: Value) -> Result<Pokemon, ApiError> {
  let api: ApiPokemon = serde_json::from_value(value)?;
  Ok(api.into())
}

fn parse_page(value: Value) -> Result<PokemonPage, ApiError> {
  let api: ApiPokemonPage = serde_json::from_value(value)?;
  Ok(api.into())
}

fn parse_species(value: Value) -> Result<Species, ApiError> {
  let api: ApiSpecies = serde_json::from_value(value)?;
  Ok(api.into())
}
