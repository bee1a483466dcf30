//! Shared fixtures for subdiv integration tests.
//!
//! - [`PlanBuilder`]: self-consistent [`GeneratedPlan`]s with knobs for the
//!   cases the validator and ranker care about.
//! - [`ScriptedClient`]: a [`GenerationClient`] that replays canned
//!   responses (streamed, complete, failing or hanging) and records every
//!   call it receives.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use subdiv_core::client::{GenerationCall, GenerationClient, ModelResponse};
use subdiv_core::error::GenerationError;
use subdiv_core::stream::ModelChunk;
use subdiv_db::models::{
    AmenityArea, GeneratedPlan, LayoutKind, Lot, MIN_LOT_AREA, PlanMetrics, RoadNetwork,
    TokenUsage,
};

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Builder for [`GeneratedPlan`]. Metrics are derived from the lots unless
/// overridden, so the default output always passes the consistency rule.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    lot_areas: Vec<f64>,
    road_area: f64,
    layout: LayoutKind,
    amenity_area: f64,
    utilization: f64,
    reported_total: Option<u32>,
    reported_viable: Option<u32>,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self {
            lot_areas: vec![120.0; 6],
            road_area: 150.0,
            layout: LayoutKind::Grid,
            amenity_area: 200.0,
            utilization: 75.0,
            reported_total: None,
            reported_viable: None,
        }
    }
}

impl PlanBuilder {
    /// Six 120 sqm lots, 150 sqm of road, 200 sqm of amenities: valid for
    /// 1000 sqm of land at 20%.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lots(mut self, areas: &[f64]) -> Self {
        self.lot_areas = areas.to_vec();
        self
    }

    pub fn road_area(mut self, area: f64) -> Self {
        self.road_area = area;
        self
    }

    pub fn layout(mut self, layout: LayoutKind) -> Self {
        self.layout = layout;
        self
    }

    pub fn amenity_area(mut self, area: f64) -> Self {
        self.amenity_area = area;
        self
    }

    pub fn utilization(mut self, percent: f64) -> Self {
        self.utilization = percent;
        self
    }

    /// Make the plan misreport its own lot counts.
    pub fn reported_counts(mut self, total: u32, viable: u32) -> Self {
        self.reported_total = Some(total);
        self.reported_viable = Some(viable);
        self
    }

    pub fn build(self) -> GeneratedPlan {
        let lots: Vec<Lot> = self
            .lot_areas
            .iter()
            .enumerate()
            .map(|(i, area)| Lot {
                number: i as u32 + 1,
                width: 10.0,
                length: area / 10.0,
                area: *area,
                x: 10.0 * i as f64,
                y: 0.0,
            })
            .collect();
        let viable = lots.iter().filter(|l| l.area >= MIN_LOT_AREA).count() as u32;
        let invalid = lots
            .iter()
            .filter(|l| l.area < MIN_LOT_AREA)
            .map(|l| l.number)
            .collect();
        let total_area: f64 = lots.iter().map(|l| l.area).sum();
        let average = if lots.is_empty() {
            0.0
        } else {
            total_area / lots.len() as f64
        };

        GeneratedPlan {
            metrics: PlanMetrics {
                total_lots: self.reported_total.unwrap_or(lots.len() as u32),
                viable_lots: self.reported_viable.unwrap_or(viable),
                invalid_lots: invalid,
                average_lot_area: average,
                land_utilization_percent: self.utilization,
            },
            lots,
            road_network: RoadNetwork {
                width: 12.0,
                total_area: self.road_area,
                layout: self.layout,
            },
            amenities: if self.amenity_area > 0.0 {
                vec![AmenityArea {
                    kind: "green_space".to_string(),
                    area: self.amenity_area,
                    position: None,
                    description: String::new(),
                }]
            } else {
                Vec::new()
            },
        }
    }

    /// The plan as the JSON document a model would emit.
    pub fn to_json(self) -> String {
        serde_json::to_string(&self.build()).unwrap_or_default()
    }
}

/// Split `text` into `n` roughly equal chunks on char boundaries.
pub fn chunked(text: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = chars.len().div_ceil(n.max(1)).max(1);
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

// ---------------------------------------------------------------------------
// Scripted client
// ---------------------------------------------------------------------------

/// One canned answer of a [`ScriptedClient`].
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these chunks, then the usage.
    Stream(Vec<String>),
    /// Stream these chunks, then fail mid-stream.
    StreamThenFail(Vec<String>, GenerationError),
    /// Non-streaming body.
    Complete(String),
    /// Fail before any output.
    Fail(GenerationError),
    /// Never answer.
    Hang,
}

impl Script {
    /// A valid plan streamed in three chunks.
    pub fn plan(builder: PlanBuilder) -> Self {
        Self::Stream(chunked(&builder.to_json(), 3))
    }
}

type Responder = dyn Fn(&GenerationCall, usize) -> Script + Send + Sync;

/// Generation client that replays canned [`Script`]s.
pub struct ScriptedClient {
    name: String,
    queue: Mutex<VecDeque<Script>>,
    responder: Option<Box<Responder>>,
    delay: Duration,
    usage: TokenUsage,
    calls: Mutex<Vec<GenerationCall>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedClient")
            .field("name", &self.name)
            .field("remaining", &self.queue.lock().len())
            .finish()
    }
}

impl ScriptedClient {
    /// Answer calls with `scripts` in order; once exhausted every call
    /// fails fatally.
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            name: "scripted".to_string(),
            queue: Mutex::new(scripts.into()),
            responder: None,
            delay: Duration::ZERO,
            usage: TokenUsage {
                input_tokens: 1_000,
                output_tokens: 2_000,
            },
            calls: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer each call with `f(call, zero_based_call_number)`.
    pub fn from_fn(f: impl Fn(&GenerationCall, usize) -> Script + Send + Sync + 'static) -> Self {
        Self {
            responder: Some(Box::new(f)),
            ..Self::new(Vec::new())
        }
    }

    /// Always answer with a valid plan.
    pub fn always(builder: PlanBuilder) -> Self {
        Self::from_fn(move |_, _| Script::plan(builder.clone()))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Hold each call open for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<GenerationCall> {
        self.calls.lock().clone()
    }

    /// Highest number of calls that were open at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_script(&self, call: &GenerationCall) -> Script {
        let n = {
            let mut calls = self.calls.lock();
            calls.push(call.clone());
            calls.len() - 1
        };
        match &self.responder {
            Some(f) => f(call, n),
            None => self.queue.lock().pop_front().unwrap_or_else(|| {
                Script::Fail(GenerationError::FatalCall("script exhausted".into()))
            }),
        }
    }
}

/// Decrements the in-flight counter when a call ends, however it ends.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, call: &GenerationCall) -> Result<ModelResponse, GenerationError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(Arc::clone(&self.in_flight));

        let script = self.next_script(call);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let usage = self.usage;
        match script {
            Script::Stream(chunks) => Ok(ModelResponse::Streaming(Box::pin(
                async_stream::stream! {
                    for chunk in chunks {
                        yield Ok(ModelChunk::Text(chunk));
                    }
                    yield Ok(ModelChunk::Usage(usage));
                },
            ))),
            Script::StreamThenFail(chunks, error) => Ok(ModelResponse::Streaming(Box::pin(
                async_stream::stream! {
                    for chunk in chunks {
                        yield Ok(ModelChunk::Text(chunk));
                    }
                    yield Err(error);
                },
            ))),
            Script::Complete(text) => Ok(ModelResponse::Complete { text, usage }),
            Script::Fail(error) => Err(error),
            Script::Hang => {
                futures::future::pending::<()>().await;
                Err(GenerationError::Cancelled)
            }
        }
    }

    fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
        usage.total() as f64 * 1e-6
    }
}
