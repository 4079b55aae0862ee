// 🕸️ Knowledge Graph - Document/Entity/Account Projection
// Projects a processed document into nodes and edges: the document itself,
// the entities it mentions, its account and balance movement, and the top
// transaction counterparties. Cross-statement links tie documents of the
// same account together.

use serde::Serialize;
use std::collections::HashMap;

use crate::document::Document;
use crate::entity_resolution::EntityResolver;
use crate::spreadsheet::NormalizedRow;

pub const EDGE_MENTIONS: &str = "MENTIONS";
pub const EDGE_HAS_ACCOUNT: &str = "HAS_ACCOUNT";
pub const EDGE_HAS_BALANCE: &str = "HAS_BALANCE";
pub const EDGE_TRANSACTS_WITH: &str = "TRANSACTS_WITH";
pub const EDGE_CROSS_CHECKED_WITH: &str = "CROSS_CHECKED_WITH";

// ============================================================================
// GRAPH TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeNode {
    pub id: String,
    pub label: String,
    pub node_type: String,
    pub properties: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeEdge {
    /// "{source}->{target}:{TYPE}"
    pub id: String,
    pub source: String,
    pub target: String,
    pub edge_type: String,
    pub properties: serde_json::Value,
}

impl KnowledgeEdge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        edge_type: &str,
        properties: serde_json::Value,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        KnowledgeEdge {
            id: format!("{}->{}:{}", source, target, edge_type),
            source,
            target,
            edge_type: edge_type.to_string(),
            properties,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KnowledgeGraph {
    pub nodes: Vec<KnowledgeNode>,
    pub edges: Vec<KnowledgeEdge>,
}

impl KnowledgeGraph {
    /// Union of two projections; nodes and edges dedupe by id.
    pub fn merge(&mut self, other: KnowledgeGraph) {
        for node in other.nodes {
            if !self.nodes.iter().any(|n| n.id == node.id) {
                self.nodes.push(node);
            }
        }
        for edge in other.edges {
            if !self.edges.iter().any(|e| e.id == edge.id) {
                self.edges.push(edge);
            }
        }
    }

    /// Node counts bucketed by node_type, for the overview endpoint.
    pub fn type_counts(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for node in &self.nodes {
            *counts.entry(node.node_type.clone()).or_default() += 1;
        }
        counts
    }
}

/// Resolved entity attached to a document, as the graph needs it.
#[derive(Debug, Clone)]
pub struct EntityRef {
    pub entity_id: String,
    pub canonical_name: String,
    pub category: String,
    pub relationship: String,
}

// ============================================================================
// GRAPH BUILDER
// ============================================================================

pub struct GraphBuilder {
    /// Counterparties kept per document, highest transaction count first
    pub top_counterparties: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder {
            top_counterparties: 10,
        }
    }

    /// Project one document with its rows and resolved entities.
    pub fn document_graph(
        &self,
        doc: &Document,
        rows: &[NormalizedRow],
        entities: &[EntityRef],
    ) -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::default();
        let doc_node_id = format!("doc:{}", doc.id);

        graph.nodes.push(KnowledgeNode {
            id: doc_node_id.clone(),
            label: doc.filename.clone(),
            node_type: "document".to_string(),
            properties: serde_json::json!({
                "doc_type": doc.doc_type,
                "status": doc.status.as_str(),
                "confidence": doc.confidence,
            }),
        });

        for entity in entities {
            let node_id = format!("entity:{}", entity.entity_id);
            if !graph.nodes.iter().any(|n| n.id == node_id) {
                graph.nodes.push(KnowledgeNode {
                    id: node_id.clone(),
                    label: entity.canonical_name.clone(),
                    node_type: "entity".to_string(),
                    properties: serde_json::json!({ "category": entity.category }),
                });
            }
            graph.edges.push(KnowledgeEdge::new(
                doc_node_id.clone(),
                node_id,
                EDGE_MENTIONS,
                serde_json::json!({ "relationship": entity.relationship }),
            ));
        }

        if let Some(account) = doc.field_str("account_number") {
            let node_id = format!("account:{}", account);
            graph.nodes.push(KnowledgeNode {
                id: node_id.clone(),
                label: account.to_string(),
                node_type: "account".to_string(),
                properties: serde_json::json!({}),
            });
            graph.edges.push(KnowledgeEdge::new(
                doc_node_id.clone(),
                node_id,
                EDGE_HAS_ACCOUNT,
                serde_json::json!({}),
            ));
        }

        let opening = doc.field_f64("opening_balance");
        let closing = doc.field_f64("closing_balance");
        if opening.is_some() || closing.is_some() {
            let node_id = format!("balance:{}", doc.id);
            let label = format!(
                "{} → {}",
                opening.map_or("?".to_string(), |v| format!("{:.2}", v)),
                closing.map_or("?".to_string(), |v| format!("{:.2}", v)),
            );
            graph.nodes.push(KnowledgeNode {
                id: node_id.clone(),
                label,
                node_type: "balance".to_string(),
                properties: serde_json::json!({ "opening": opening, "closing": closing }),
            });
            graph.edges.push(KnowledgeEdge::new(
                doc_node_id.clone(),
                node_id,
                EDGE_HAS_BALANCE,
                serde_json::json!({}),
            ));
        }

        for (key, label, count, total) in self.top_parties(rows) {
            let node_id = format!("party:{}", key);
            graph.nodes.push(KnowledgeNode {
                id: node_id.clone(),
                label,
                node_type: "counterparty".to_string(),
                properties: serde_json::json!({}),
            });
            graph.edges.push(KnowledgeEdge::new(
                doc_node_id.clone(),
                node_id,
                EDGE_TRANSACTS_WITH,
                serde_json::json!({ "count": count, "total": total }),
            ));
        }

        graph
    }

    /// CROSS_CHECKED_WITH edge between two documents of the same account.
    pub fn link_documents(&self, doc_id: &str, other_doc_id: &str, reason: &str) -> KnowledgeEdge {
        KnowledgeEdge::new(
            format!("doc:{}", doc_id),
            format!("doc:{}", other_doc_id),
            EDGE_CROSS_CHECKED_WITH,
            serde_json::json!({ "reason": reason }),
        )
    }

    /// Counterparties ranked by transaction count, capped at the limit.
    fn top_parties(&self, rows: &[NormalizedRow]) -> Vec<(String, String, usize, f64)> {
        let mut parties: HashMap<String, (String, usize, f64)> = HashMap::new();
        for row in rows {
            let key = match counterparty_key(&row.description) {
                Some(k) => k,
                None => continue,
            };
            let entry = parties
                .entry(key)
                .or_insert_with(|| (row.description.trim().to_string(), 0, 0.0));
            entry.1 += 1;
            entry.2 += row.amount;
        }

        let mut ranked: Vec<(String, String, usize, f64)> = parties
            .into_iter()
            .map(|(k, (label, count, total))| (k, label, count, total))
            .collect();
        ranked.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.top_counterparties);
        ranked
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable counterparty key from a transaction description: normalized,
/// stripped of payment-rail noise and reference digits.
pub fn counterparty_key(description: &str) -> Option<String> {
    const RAIL_NOISE: &[&str] = &[
        "upi", "neft", "imps", "rtgs", "ach", "pos", "atm", "ref", "txn", "transfer", "payment",
        "to", "from",
    ];
    let normalized = EntityResolver::normalize_name(description);
    let tokens: Vec<&str> = normalized
        .split_whitespace()
        .filter(|t| t.len() >= 2)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !RAIL_NOISE.contains(t))
        .take(4)
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

// ============================================================================
// TESTS
// ============================================================================
