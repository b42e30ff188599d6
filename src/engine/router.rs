//! Best-price routing across the venues linked to one match.
//!
//! This is the only place where a user's bet direction is reconciled with
//! venue vocabulary: "YES" matches a venue's own YES outcome, and also any
//! outcome typed `win` on venues that list named sides.

use futures::future::join_all;
use tracing::{debug, warn};

use crate::platforms::VenueRegistry;
use crate::storage::Store;
use crate::types::{AppError, CanonicalEvent, Event, NewOdds, Odds, OptionType};

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// One priced outcome on one venue.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub platform_id: i64,
    pub option_name: String,
    pub option_type: OptionType,
    pub price: f64,
}

impl From<&Odds> for Quote {
    fn from(o: &Odds) -> Self {
        Self {
            platform_id: o.platform_id,
            option_name: o.option_name.clone(),
            option_type: o.option_type,
            price: o.price,
        }
    }
}

impl From<&NewOdds> for Quote {
    fn from(o: &NewOdds) -> Self {
        Self {
            platform_id: o.platform_id,
            option_name: o.option_name.clone(),
            option_type: o.option_type,
            price: o.price,
        }
    }
}

/// Venue chosen for a bet, with the venue's own label for the outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub platform_id: i64,
    pub price: f64,
    pub option_name: String,
}

/// Whether an outcome answers a bet on `bet_option`.
pub fn option_matches(option_name: &str, option_type: OptionType, bet_option: &str) -> bool {
    if option_name.trim().eq_ignore_ascii_case(bet_option) {
        return true;
    }
    if bet_option.eq_ignore_ascii_case("yes") {
        option_type == OptionType::Win
    } else if bet_option.eq_ignore_ascii_case("no") {
        option_type == OptionType::Lose
    } else {
        false
    }
}

/// Highest-priced matching outcome; the first one seen wins a tie.
pub fn select_best(quotes: &[Quote], bet_option: &str) -> Result<Selection, AppError> {
    let bet = bet_option.trim();
    if bet.is_empty() {
        return Err(AppError::InvalidInput("bet_option is required".into()));
    }

    let mut best: Option<&Quote> = None;
    for q in quotes.iter().filter(|q| option_matches(&q.option_name, q.option_type, bet)) {
        if best.map_or(true, |b| q.price > b.price) {
            best = Some(q);
        }
    }

    best.map(|q| Selection {
        platform_id: q.platform_id,
        price: q.price,
        option_name: q.option_name.clone(),
    })
    .ok_or_else(|| AppError::NotFound(format!("no odds match option {bet}")))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// A match resolved from a canonical id or an event uuid.
#[derive(Debug, Clone)]
pub struct ResolvedMatch {
    /// The event the caller addressed, or the first linked one.
    pub event: Event,
    pub canonical: Option<CanonicalEvent>,
    /// One event per linked venue; just `event` when there is no canonical.
    pub linked: Vec<Event>,
}

impl ResolvedMatch {
    /// Linked event on `platform_id`, falling back to the addressed event.
    pub fn event_on(&self, platform_id: i64) -> &Event {
        self.linked
            .iter()
            .find(|e| e.platform_id == platform_id)
            .unwrap_or(&self.event)
    }
}

/// Routed price for one bet.
#[derive(Debug, Clone)]
pub struct RouteQuote {
    pub matched: ResolvedMatch,
    pub selection: Selection,
    /// Event to place on: the linked event of the selected venue.
    pub target: Event,
    /// Venues whose prices came from the store instead of a live fetch.
    pub stale_platforms: Vec<i64>,
}

#[derive(Clone)]
pub struct Router {
    store: Store,
    registry: VenueRegistry,
}

impl Router {
    pub fn new(store: Store, registry: VenueRegistry) -> Self {
        Self { store, registry }
    }

    /// Resolve a numeric canonical id or an `event_uuid`.
    pub async fn resolve(&self, id: &str) -> Result<ResolvedMatch, AppError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(AppError::InvalidInput("event id is required".into()));
        }

        if let Ok(canonical_id) = id.parse::<i64>() {
            let canonical = self
                .store
                .get_canonical(canonical_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("canonical event {id} not found")))?;
            let linked = self.linked_events(canonical.id).await?;
            let event = linked
                .first()
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("canonical event {id} has no venues")))?;
            return Ok(ResolvedMatch {
                event,
                canonical: Some(canonical),
                linked,
            });
        }

        let event = self
            .store
            .get_event_by_uuid(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("event {id} not found")))?;
        match self.store.canonical_for_event(event.id).await? {
            Some(canonical) => {
                let mut linked = self.linked_events(canonical.id).await?;
                if !linked.iter().any(|e| e.id == event.id) {
                    linked.push(event.clone());
                }
                Ok(ResolvedMatch {
                    event,
                    canonical: Some(canonical),
                    linked,
                })
            }
            None => Ok(ResolvedMatch {
                linked: vec![event.clone()],
                event,
                canonical: None,
            }),
        }
    }

    async fn linked_events(&self, canonical_id: i64) -> Result<Vec<Event>, AppError> {
        let mut events = Vec::new();
        for link in self.store.links_for_canonical(canonical_id).await? {
            if let Some(event) = self.store.get_event(link.event_id).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Route a bet on `bet_option` for the match `id`.
    ///
    /// Every linked venue is asked for live prices concurrently. A venue
    /// that fails, or has no adapter, contributes its stored prices
    /// instead. Live prices are written back to the store.
    pub async fn quote(&self, id: &str, bet_option: &str) -> Result<RouteQuote, AppError> {
        if bet_option.trim().is_empty() {
            return Err(AppError::InvalidInput("bet_option is required".into()));
        }
        let matched = self.resolve(id).await?;

        let fetches = matched.linked.iter().map(|event| async move {
            let live = match self.registry.get(event.platform_id) {
                Some(adapter) => match adapter.fetch_live_odds(&event.platform_event_id).await {
                    Ok(rows) if !rows.is_empty() => Some(rows),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(
                            platform = adapter.name(),
                            event = %event.event_uuid,
                            error = %format!("{e:#}"),
                            "Live odds fetch failed, using stored prices"
                        );
                        None
                    }
                },
                None => None,
            };
            (event, live)
        });
        let fetched = join_all(fetches).await;

        let mut quotes: Vec<Quote> = Vec::new();
        let mut stale_platforms = Vec::new();
        for (event, live) in fetched {
            match live {
                Some(rows) => {
                    quotes.extend(rows.iter().map(Quote::from));
                    if let Err(e) = self.store.upsert_odds(event.id, &rows).await {
                        warn!(event = %event.event_uuid, error = %e, "Odds write-back failed");
                    }
                }
                None => {
                    stale_platforms.push(event.platform_id);
                    let stored = self.store.odds_for_event(event.id).await?;
                    quotes.extend(stored.iter().map(Quote::from));
                }
            }
        }

        let selection = select_best(&quotes, bet_option)?;
        let target = matched.event_on(selection.platform_id).clone();
        debug!(
            event = %matched.event.event_uuid,
            platform_id = selection.platform_id,
            option = %selection.option_name,
            price = selection.price,
            candidates = quotes.len(),
            "Route selected"
        );
        Ok(RouteQuote {
            matched,
            selection,
            target,
            stale_platforms,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
