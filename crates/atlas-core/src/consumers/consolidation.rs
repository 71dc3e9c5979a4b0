//! Consumer 4 - periodic re-consolidation with active forgetting
//!
//! Runs on a schedule (default every 6 hours) and immediately when a
//! reflection trigger lands on the stream. One pass performs, in order:
//! pattern detection, workflow extraction, cross-session preference merging,
//! hierarchical summarization, importance recalculation, four-tier graph
//! retention, and event-store trimming. Summaries are always created before
//! anything is pruned, so a partial failure leaves lineage intact.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::domain::{
    entity_id, event_node_id, AbstractionLevel, BehavioralPatternNodeAttrs, DerivationMethod,
    DerivedFromProps, EdgeKind, EntityType, NodeKind, PatternType, SummaryNodeAttrs, SummaryScope,
    WorkflowNodeAttrs,
};
use crate::eventstore::RetentionReport;
use crate::graph::{GraphError, NodeRecord, StoredNode};

use super::{deterministic_id, ConsumerContext, GROUP_CONSOLIDATION};

/// How many recent events feed the statistical passes
const ANALYSIS_WINDOW: usize = 2000;

/// Minimum occurrences for a routine pattern
const ROUTINE_MIN_COUNT: usize = 5;

/// Minimum occurrences for a workflow case
const WORKFLOW_MIN_COUNT: usize = 2;

/// What one consolidation pass did
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub patterns_upserted: u64,
    pub workflows_upserted: u64,
    pub preferences_merged: u64,
    pub summaries_created: u64,
    pub importance_recalculated: u64,
    pub similar_edges_dropped: u64,
    pub events_pruned: u64,
    pub retention: RetentionReport,
}

/// Consolidation consumer
pub struct ConsolidationConsumer {
    ctx: ConsumerContext,
    consumer_name: String,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl ConsolidationConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self {
            ctx,
            consumer_name: "consolidation-1".to_string(),
            last_run: Mutex::new(None),
        }
    }

    /// Long-running loop: scheduled passes plus reflection triggers
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.ctx.config.consumers.poll_interval_ms.max(500));
        let interval = Duration::from_secs(self.ctx.config.consolidation.interval_hours * 3600);
        let mut next_scheduled = tokio::time::Instant::now() + interval;

        loop {
            if *shutdown.borrow() {
                return;
            }
            let triggered = match self.drain_triggers() {
                Ok(triggered) => triggered,
                Err(error) => {
                    tracing::warn!(%error, "consolidation trigger drain failed");
                    false
                }
            };
            let scheduled = tokio::time::Instant::now() >= next_scheduled;
            if triggered || scheduled {
                if scheduled {
                    next_scheduled = tokio::time::Instant::now() + interval;
                }
                match self.run_pass(Utc::now()) {
                    Ok(report) => tracing::info!(?report, "consolidation pass complete"),
                    Err(error) => tracing::warn!(%error, "consolidation pass failed"),
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Ack everything delivered to this group; report whether a reflection
    /// trigger was among it
    pub fn drain_triggers(&self) -> crate::eventstore::Result<bool> {
        let mut triggered = false;
        loop {
            let batch = self.ctx.events.read_group(
                GROUP_CONSOLIDATION,
                &self.consumer_name,
                self.ctx.config.consumers.batch_size,
                Duration::from_millis(self.ctx.config.consumers.claim_idle_ms),
                None,
            )?;
            if batch.is_empty() {
                return Ok(triggered);
            }
            for entry in batch {
                triggered |= entry.event.is_reflection_trigger();
                self.ctx.events.ack(GROUP_CONSOLIDATION, entry.position)?;
            }
        }
    }

    // ========================================================================
    // ONE PASS
    // ========================================================================

    /// Execute a full consolidation pass at the given (possibly simulated)
    /// time
    pub fn run_pass(&self, now: DateTime<Utc>) -> Result<ConsolidationReport, GraphError> {
        let mut report = ConsolidationReport::default();

        let recent = self.recent_events()?;
        report.patterns_upserted = self.detect_patterns(&recent, now)?;
        report.workflows_upserted = self.extract_workflows(&recent, now)?;
        report.preferences_merged = self.merge_preferences(now)?;
        report.summaries_created = self.summarize(now)?;
        report.importance_recalculated = self.recalculate_importance()?;

        let (dropped, pruned) = self.active_forgetting(now)?;
        report.similar_edges_dropped = dropped;
        report.events_pruned = pruned;
        self.ctx.metrics.record_pruned(pruned);

        report.retention = self
            .ctx
            .events
            .enforce_retention(
                now,
                self.ctx.config.storage.hot_days,
                self.ctx.config.storage.ceiling_days,
            )
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;

        // Metric emission
        if let Ok(mut last) = self.last_run.lock() {
            if let Some(previous) = *last {
                self.ctx
                    .metrics
                    .set_consolidation_lag_seconds((now - previous).num_seconds().max(0) as u64);
            }
            *last = Some(now);
        }
        self.ctx.metrics.set_reconsolidation_last_run(now.timestamp());

        Ok(report)
    }

    fn recent_events(&self) -> Result<Vec<crate::domain::Event>, GraphError> {
        self.ctx
            .events
            .search(
                &crate::eventstore::EventQuery::default(),
                crate::eventstore::SortOrder::Desc,
                ANALYSIS_WINDOW,
                None,
            )
            .map(|page| page.events)
            .map_err(|e| GraphError::Unavailable(e.to_string()))
    }

    // ========================================================================
    // 1. CROSS-SESSION PATTERN DETECTION
    // ========================================================================

    /// Frequency and co-occurrence statistics produce candidate patterns;
    /// descriptions are statistical (the provider hook refines them when a
    /// model is configured).
    fn detect_patterns(
        &self,
        events: &[crate::domain::Event],
        now: DateTime<Utc>,
    ) -> Result<u64, GraphError> {
        let mut upserted = 0u64;

        // Routine: the same event type recurring for one agent
        let mut by_agent_type: HashMap<(String, String), Vec<&crate::domain::Event>> =
            HashMap::new();
        for event in events {
            if event.type_namespace() == "system" {
                continue;
            }
            by_agent_type
                .entry((event.agent_id.clone(), event.event_type.clone()))
                .or_default()
                .push(event);
        }
        for ((agent, event_type), occurrences) in &by_agent_type {
            if occurrences.len() < ROUTINE_MIN_COUNT {
                continue;
            }
            let Some(user_entity) = self.user_entity_for_agent(agent)? else {
                continue;
            };
            let description = format!(
                "{} recurring {} times across {} sessions",
                event_type,
                occurrences.len(),
                occurrences
                    .iter()
                    .map(|e| e.session_id.as_str())
                    .collect::<HashSet<_>>()
                    .len()
            );
            upserted += self.upsert_pattern(
                &user_entity,
                PatternType::Routine,
                &deterministic_id("pattern", &[agent, "routine", event_type]),
                &description,
                (occurrences.len() as f64 / 10.0).min(0.9),
                occurrences.len() as i64,
                &[agent.clone()],
                occurrences.iter().take(3).map(|e| e.event_id.clone()).collect(),
                DerivationMethod::FrequencyAnalysis,
                now,
            )?;
        }

        // Delegation: multiple agents sharing a session
        let mut agents_by_session: HashMap<String, HashSet<String>> = HashMap::new();
        for event in events {
            agents_by_session
                .entry(event.session_id.clone())
                .or_default()
                .insert(event.agent_id.clone());
        }
        for (session, agents) in agents_by_session.iter().filter(|(_, a)| a.len() > 1) {
            let mut involved: Vec<String> = agents.iter().cloned().collect();
            involved.sort();
            let Some(user_entity) = self.user_entity_for_agent(&involved[0])? else {
                continue;
            };
            let sample: Vec<String> = events
                .iter()
                .filter(|e| &e.session_id == session)
                .take(3)
                .map(|e| e.event_id.clone())
                .collect();
            upserted += self.upsert_pattern(
                &user_entity,
                PatternType::Delegation,
                &deterministic_id("pattern", &[&involved.join(","), "delegation"]),
                &format!("work delegated across {} agents in one session", involved.len()),
                0.6,
                1,
                &involved,
                sample,
                DerivationMethod::StatisticalInference,
                now,
            )?;
        }

        Ok(upserted)
    }

    fn user_entity_for_agent(&self, agent_id: &str) -> Result<Option<String>, GraphError> {
        let id = entity_id(agent_id, EntityType::User);
        Ok(self.ctx.graph.get_entity(&id)?.map(|node| node.id))
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_pattern(
        &self,
        user_entity: &str,
        pattern_type: PatternType,
        pattern_id: &str,
        description: &str,
        confidence: f64,
        observation_count: i64,
        involved_agents: &[String],
        evidence_event_ids: Vec<String>,
        method: DerivationMethod,
        now: DateTime<Utc>,
    ) -> Result<u64, GraphError> {
        let existing = self.ctx.graph.get_node(pattern_id)?;
        let first_detected_at = existing
            .as_ref()
            .and_then(|n| n.attrs["firstDetectedAt"].as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now);
        let prior_observations = existing
            .as_ref()
            .and_then(|n| n.attrs["observationCount"].as_i64())
            .unwrap_or(0);

        let attrs = BehavioralPatternNodeAttrs {
            pattern_id: pattern_id.to_string(),
            pattern_type,
            description: description.to_string(),
            confidence,
            observation_count: prior_observations.max(observation_count),
            involved_agents: involved_agents.to_vec(),
            first_detected_at,
            last_confirmed_at: now,
        };
        self.ctx.graph.put_node(&NodeRecord {
            occurred_at: Some(now),
            ..NodeRecord::new(
                pattern_id.to_string(),
                NodeKind::BehavioralPattern,
                serde_json::to_value(&attrs)?,
            )
        })?;
        self.ctx
            .graph
            .create_edge(user_entity, pattern_id, EdgeKind::ExhibitsPattern, json!({}))?;
        for event_id in evidence_event_ids {
            let node = event_node_id(&event_id);
            if self.ctx.graph.get_node(&node)?.is_some() {
                self.ctx.graph.create_edge(
                    pattern_id,
                    &node,
                    EdgeKind::DerivedFrom,
                    serde_json::to_value(DerivedFromProps {
                        derivation_method: method,
                        derived_at: now,
                        model_id: None,
                        prompt_version: None,
                        evidence_quote: None,
                        source_turn_index: None,
                    })?,
                )?;
            }
        }
        Ok(1)
    }

    // ========================================================================
    // 2. WORKFLOW EXTRACTION
    // ========================================================================

    /// Recurring contiguous event-type bigrams become Workflow(case) nodes
    fn extract_workflows(
        &self,
        events: &[crate::domain::Event],
        now: DateTime<Utc>,
    ) -> Result<u64, GraphError> {
        let mut by_session: BTreeMap<String, Vec<&crate::domain::Event>> = BTreeMap::new();
        for event in events {
            if event.type_namespace() == "system" {
                continue;
            }
            by_session.entry(event.session_id.clone()).or_default().push(event);
        }

        struct BigramStats {
            count: usize,
            total_ms: i64,
            sessions: HashSet<String>,
            sample_events: Vec<String>,
        }
        let mut bigrams: HashMap<(String, String), BigramStats> = HashMap::new();
        for (session, mut session_events) in by_session {
            session_events.sort_by_key(|e| e.occurred_at);
            for pair in session_events.windows(2) {
                let key = (pair[0].event_type.clone(), pair[1].event_type.clone());
                let stats = bigrams.entry(key).or_insert_with(|| BigramStats {
                    count: 0,
                    total_ms: 0,
                    sessions: HashSet::new(),
                    sample_events: Vec::new(),
                });
                stats.count += 1;
                stats.total_ms += (pair[1].occurred_at - pair[0].occurred_at).num_milliseconds();
                stats.sessions.insert(session.clone());
                if stats.sample_events.len() < 2 {
                    stats.sample_events.push(pair[0].event_id.clone());
                }
            }
        }

        let mut upserted = 0u64;
        for ((from, to), stats) in bigrams {
            if stats.count < WORKFLOW_MIN_COUNT {
                continue;
            }
            let workflow_id = deterministic_id("wf", &[&from, &to]);
            let mut sessions: Vec<String> = stats.sessions.into_iter().collect();
            sessions.sort();
            let attrs = WorkflowNodeAttrs {
                workflow_id: workflow_id.clone(),
                name: format!("{from} then {to}"),
                abstraction_level: AbstractionLevel::Case,
                success_rate: 1.0,
                execution_count: stats.count as i64,
                avg_duration_ms: stats.total_ms as f64 / stats.count as f64,
                source_session_ids: sessions,
            };
            self.ctx.graph.put_node(&NodeRecord {
                occurred_at: Some(now),
                ..NodeRecord::new(
                    workflow_id.clone(),
                    NodeKind::Workflow,
                    serde_json::to_value(&attrs)?,
                )
            })?;
            for event_id in &stats.sample_events {
                let node = event_node_id(event_id);
                if self.ctx.graph.get_node(&node)?.is_some() {
                    self.ctx.graph.create_edge(
                        &workflow_id,
                        &node,
                        EdgeKind::DerivedFrom,
                        serde_json::to_value(DerivedFromProps {
                            derivation_method: DerivationMethod::FrequencyAnalysis,
                            derived_at: now,
                            model_id: None,
                            prompt_version: None,
                            evidence_quote: None,
                            source_turn_index: None,
                        })?,
                    )?;
                }
            }
            upserted += 1;
        }
        Ok(upserted)
    }

    // ========================================================================
    // 3. CROSS-SESSION PREFERENCE MERGING
    // ========================================================================

    /// Equivalent active preferences collapse onto the earliest observation:
    /// it is reinforced, the newer duplicates get superseded_by pointers.
    fn merge_preferences(&self, now: DateTime<Utc>) -> Result<u64, GraphError> {
        let mut merged = 0u64;
        let users: Vec<StoredNode> = self
            .ctx
            .graph
            .list_entities(500)?
            .into_iter()
            .filter(|node| node.attrs["entityType"].as_str() == Some("user"))
            .collect();

        for user in users {
            let prefs = self.ctx.graph.targets_of(&user.id, EdgeKind::HasPreference)?;
            let mut groups: HashMap<(String, String, String), Vec<StoredNode>> = HashMap::new();
            for (_, node) in prefs {
                if !node.attrs["supersededBy"].is_null() {
                    continue;
                }
                let key = (
                    node.attrs["category"].as_str().unwrap_or_default().to_string(),
                    node.attrs["key"].as_str().unwrap_or_default().to_string(),
                    node.attrs["polarity"].as_str().unwrap_or_default().to_string(),
                );
                groups.entry(key).or_default().push(node);
            }
            for (_, mut group) in groups {
                if group.len() < 2 {
                    continue;
                }
                group.sort_by_key(|node| {
                    node.attrs["firstObservedAt"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_default()
                });
                let keeper = group.remove(0);
                self.ctx.graph.reinforce_preference(
                    &keeper.id,
                    now,
                    self.ctx.config.scoring.decay.s_boost_hours,
                )?;
                for duplicate in group {
                    self.ctx.graph.set_superseded(&duplicate.id, &keeper.id)?;
                    merged += 1;
                }
            }
        }
        Ok(merged)
    }

    // ========================================================================
    // 4. HIERARCHICAL SUMMARIZATION
    // ========================================================================

    /// Session, episode (trace) and agent summaries with SUMMARIZES edges.
    /// Ids are deterministic, so re-runs refresh rather than duplicate.
    fn summarize(&self, now: DateTime<Utc>) -> Result<u64, GraphError> {
        let mut created = 0u64;
        let mut session_summary_by_agent: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for stats in self.ctx.graph.session_event_stats(200)? {
            if stats.event_count < 2 {
                continue;
            }
            let nodes = self.ctx.graph.get_context(&stats.session_id, 512)?;
            let summary_id = deterministic_id("sum", &["session", &stats.session_id]);
            let type_counts = top_event_types(&nodes);
            let content = format!(
                "Session {}: {} events ({})",
                stats.session_id, stats.event_count, type_counts
            );
            created += self.upsert_summary(
                &summary_id,
                SummaryScope::Session,
                &stats.session_id,
                &content,
                nodes.iter().map(|n| n.id.clone()).collect(),
                stats.event_count as i64,
                ms_to_time(stats.first_ms),
                ms_to_time(stats.last_ms),
                now,
            )?;
            if let Some(agent) = &stats.agent_id {
                session_summary_by_agent
                    .entry(agent.clone())
                    .or_default()
                    .push(summary_id.clone());
            }

            // Episodes: traces with enough events inside the session
            let mut by_trace: BTreeMap<String, Vec<&StoredNode>> = BTreeMap::new();
            for node in &nodes {
                if let Some(trace) = node.attrs["traceId"].as_str() {
                    by_trace.entry(trace.to_string()).or_default().push(node);
                }
            }
            for (trace, members) in by_trace.into_iter().filter(|(_, m)| m.len() >= 3) {
                let times: Vec<DateTime<Utc>> =
                    members.iter().filter_map(|n| n.occurred_at).collect();
                let (Some(start), Some(end)) =
                    (times.iter().min().copied(), times.iter().max().copied())
                else {
                    continue;
                };
                created += self.upsert_summary(
                    &deterministic_id("sum", &["episode", &trace]),
                    SummaryScope::Episode,
                    &trace,
                    &format!("Episode {}: {} events in session {}", trace, members.len(), stats.session_id),
                    members.iter().map(|n| n.id.clone()).collect(),
                    members.len() as i64,
                    start,
                    end,
                    now,
                )?;
            }
        }

        // Agent scope rolls up session summaries
        for (agent, summaries) in session_summary_by_agent
            .into_iter()
            .filter(|(_, s)| s.len() >= 2)
        {
            created += self.upsert_summary(
                &deterministic_id("sum", &["agent", &agent]),
                SummaryScope::Agent,
                &agent,
                &format!("Agent {}: {} summarized sessions", agent, summaries.len()),
                summaries,
                0,
                now,
                now,
                now,
            )?;
        }
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_summary(
        &self,
        summary_id: &str,
        scope: SummaryScope,
        scope_id: &str,
        content: &str,
        member_ids: Vec<String>,
        event_count: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, GraphError> {
        let fresh = self.ctx.graph.get_node(summary_id)?.is_none();
        let attrs = SummaryNodeAttrs {
            summary_id: summary_id.to_string(),
            scope,
            scope_id: scope_id.to_string(),
            content: content.to_string(),
            created_at: now,
            event_count,
            time_range_start: start,
            time_range_end: end,
        };
        self.ctx.graph.put_node(&NodeRecord {
            occurred_at: Some(now),
            session_id: (scope == SummaryScope::Session).then(|| scope_id.to_string()),
            ..NodeRecord::new(
                summary_id.to_string(),
                NodeKind::Summary,
                serde_json::to_value(&attrs)?,
            )
        })?;
        let edges: Vec<(String, String, EdgeKind, Value)> = member_ids
            .into_iter()
            .map(|member| (summary_id.to_string(), member, EdgeKind::Summarizes, json!({})))
            .collect();
        self.ctx.graph.create_edges_batch(&edges)?;
        Ok(u64::from(fresh))
    }

    // ========================================================================
    // 5. IMPORTANCE RECALCULATION
    // ========================================================================

    /// High-traffic nodes (by degree centrality) get an importance boost
    fn recalculate_importance(&self) -> Result<u64, GraphError> {
        let mut updated = 0u64;
        for node in self.ctx.graph.recent_embedded_events(200)? {
            let degree = self.ctx.graph.degree(&node.id)?;
            if degree < 4 {
                continue;
            }
            let current = node.importance.unwrap_or(1.0);
            let boosted = (current + (degree as f64).ln()).clamp(1.0, 10.0);
            if boosted > current {
                self.ctx.graph.set_importance(&node.id, boosted)?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    // ========================================================================
    // 6. ACTIVE FORGETTING
    // ========================================================================

    /// Four-tier graph retention. Summaries exist before anything is
    /// deleted (step 4 ran first), so pruning preserves lineage paths.
    fn active_forgetting(&self, now: DateTime<Utc>) -> Result<(u64, u64), GraphError> {
        // Warm: weak similarity edges on nodes older than a day
        let dropped = self
            .ctx
            .graph
            .delete_weak_similarity(0.7, now - ChronoDuration::hours(24))?;

        // Cold (7-30d): keep only important or frequently accessed events
        let cold: Vec<String> = self
            .ctx
            .graph
            .prunable_events(now - ChronoDuration::days(7), 5.0, 3, false)?
            .into_iter()
            .map(|n| n.id)
            .collect();
        let mut pruned = self.ctx.graph.delete_nodes(&cold)?;

        // Archive (>30d): events leave the graph, summaries persist; only
        // nodes both important and reinforced survive
        let archive: Vec<String> = self
            .ctx
            .graph
            .archivable_events(now - ChronoDuration::days(30))?
            .into_iter()
            .filter(|node| {
                !(node.importance.unwrap_or(0.0) >= 5.0 && node.access_count >= 3)
            })
            .map(|n| n.id)
            .collect();
        pruned += self.ctx.graph.delete_nodes(&archive)?;

        Ok((dropped, pruned))
    }
}

fn top_event_types(nodes: &[StoredNode]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for node in nodes {
        if let Some(event_type) = node.attrs["eventType"].as_str() {
            *counts.entry(event_type).or_default() += 1;
        }
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
        .into_iter()
        .take(3)
        .map(|(t, c)| format!("{t} x{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn ms_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumers::tests_support::{append_event, make_ctx, make_event};
    use crate::consumers::{EnrichmentConsumer, ProjectionConsumer};

    fn project_and_enrich(ctx: &ConsumerContext) {
        let projection = ProjectionConsumer::new(ctx.clone());
        let enrichment = EnrichmentConsumer::new(ctx.clone());
        while projection.run_once().unwrap() > 0 {}
        while enrichment.run_once().unwrap() > 0 {}
    }

    #[test]
    fn summaries_cover_sessions_and_episodes() {
        let (_dir, ctx) = make_ctx();
        for i in 0..4 {
            append_event(&ctx, &make_event(&format!("e{i}"), "s1", "tool.call", i), None);
        }
        project_and_enrich(&ctx);

        let consolidation = ConsolidationConsumer::new(ctx.clone());
        let report = consolidation.run_pass(Utc::now()).unwrap();
        assert!(report.summaries_created >= 1);

        let counts = ctx.graph.count_nodes_by_kind().unwrap();
        assert!(counts["summary"] >= 1);

        // SUMMARIZES edges reach the contributing events
        let session_summary = deterministic_id("sum", &["session", "s1"]);
        let members = ctx
            .graph
            .edges_of(&session_summary, true, false, &[EdgeKind::Summarizes])
            .unwrap();
        assert_eq!(members.len(), 4);
    }

    #[test]
    fn routine_pattern_emerges_from_recurrence() {
        let (_dir, ctx) = make_ctx();
        // A known user entity for the agent
        ctx.graph
            .merge_entity_node("a1", EntityType::User, Utc::now())
            .unwrap();
        for i in 0..6 {
            append_event(
                &ctx,
                &make_event(&format!("e{i}"), &format!("s{}", i % 2), "tool.call", i),
                None,
            );
        }
        project_and_enrich(&ctx);

        let consolidation = ConsolidationConsumer::new(ctx.clone());
        let report = consolidation.run_pass(Utc::now()).unwrap();
        assert!(report.patterns_upserted >= 1);

        let user_entity = entity_id("a1", EntityType::User);
        let patterns = ctx.graph.targets_of(&user_entity, EdgeKind::ExhibitsPattern).unwrap();
        assert!(!patterns.is_empty());
        let (_, pattern) = &patterns[0];
        assert_eq!(pattern.attrs["patternType"], "routine");

        // Provenance totality: the pattern is derived from events
        let derived = ctx
            .graph
            .edges_of(&pattern.id, true, false, &[EdgeKind::DerivedFrom])
            .unwrap();
        assert!(!derived.is_empty());
    }

    #[test]
    fn workflows_capture_recurring_sequences() {
        let (_dir, ctx) = make_ctx();
        for session in ["s1", "s2"] {
            let base = if session == "s1" { 0 } else { 100 };
            append_event(&ctx, &make_event(&format!("{session}_a"), session, "tool.call", base), None);
            append_event(
                &ctx,
                &make_event(&format!("{session}_b"), session, "llm.response", base + 1),
                None,
            );
        }
        project_and_enrich(&ctx);

        let consolidation = ConsolidationConsumer::new(ctx.clone());
        let report = consolidation.run_pass(Utc::now()).unwrap();
        assert!(report.workflows_upserted >= 1);

        let workflow_id = deterministic_id("wf", &["tool.call", "llm.response"]);
        let workflow = ctx.graph.get_node(&workflow_id).unwrap().unwrap();
        assert_eq!(workflow.attrs["executionCount"], 2);
        assert_eq!(workflow.attrs["abstractionLevel"], "case");
    }

    #[test]
    fn pass_is_idempotent() {
        let (_dir, ctx) = make_ctx();
        for i in 0..4 {
            append_event(&ctx, &make_event(&format!("e{i}"), "s1", "tool.call", i), None);
        }
        project_and_enrich(&ctx);

        let consolidation = ConsolidationConsumer::new(ctx.clone());
        consolidation.run_pass(Utc::now()).unwrap();
        let counts_before = ctx.graph.count_nodes_by_kind().unwrap();

        let second = consolidation.run_pass(Utc::now()).unwrap();
        assert_eq!(second.summaries_created, 0);
        assert_eq!(ctx.graph.count_nodes_by_kind().unwrap(), counts_before);
    }

    #[test]
    fn reflection_trigger_drains_and_fires() {
        let (_dir, ctx) = make_ctx();
        append_event(&ctx, &make_event("e1", "s1", "tool.call", 0), None);
        let trigger = make_event("r1", "system", crate::domain::REFLECTION_EVENT_TYPE, 1);
        append_event(&ctx, &trigger, None);

        let consolidation = ConsolidationConsumer::new(ctx.clone());
        assert!(consolidation.drain_triggers().unwrap());
        assert!(!consolidation.drain_triggers().unwrap());
        assert_eq!(ctx.events.pending(GROUP_CONSOLIDATION).unwrap().count, 0);
    }
}
