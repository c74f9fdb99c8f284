//! Mermaid diagrams of graph structure
//!
//! ```text
//! graph TD
//!     start_node((START))
//!     n_inspect["inspect"]
//!     n_build(["build"])
//!     start_node --> n_inspect
//!     n_inspect -->|ready| n_build
//!     n_inspect -.->|error| n_recover
//!     n_build --> end_node
//! ```
//!
//! Shapes: terminals are stadiums, fan-out nodes are subroutines listing
//! their branches, sub-workflow nodes are hexagons naming the child graph.
//! Error edges are dashed.

use crate::executor::CompiledGraph;
use crate::graph::{Edge, Graph, NodeKind, END};

/// Diagram options
#[derive(Debug, Clone, Default)]
pub struct VisualizationOptions {
    pub title: Option<String>,
    /// Annotate nodes with retry and failure-policy settings
    pub include_details: bool,
}

impl VisualizationOptions {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_details(mut self) -> Self {
        self.include_details = true;
        self
    }
}

/// Render `graph` as a Mermaid flowchart
pub fn visualize_mermaid(graph: &Graph, options: &VisualizationOptions) -> String {
    let mut lines = Vec::new();

    if let Some(title) = &options.title {
        lines.push("---".to_string());
        lines.push(format!("title: {}", escape(title)));
        lines.push("---".to_string());
    }
    lines.push("graph TD".to_string());
    lines.push("    start_node((START))".to_string());
    lines.push("    end_node((END))".to_string());

    for name in &graph.order {
        let Some(spec) = graph.node(name) else {
            continue;
        };

        let mut label = match &spec.kind {
            NodeKind::Stage => name.clone(),
            NodeKind::Parallel { branches } => format!("{} ({})", name, branches.join(", ")),
            NodeKind::Subworkflow { graph } => format!("{} → {}", name, graph),
        };
        if options.include_details {
            if let Some(retry) = &spec.retry {
                label.push_str(&format!("<br/>retry ×{}", retry.max_attempts));
            }
            if let Some(policy) = &spec.failure_policy {
                label.push_str(&format!("<br/>on failure: {:?}", policy).to_lowercase());
            }
        }

        let label = escape(&label);
        let id = node_id(name);
        let shape = match (&spec.kind, graph.is_terminal(name)) {
            (_, true) => format!("{}([\"{}\"])", id, label),
            (NodeKind::Parallel { .. }, false) => format!("{}[[\"{}\"]]", id, label),
            (NodeKind::Subworkflow { .. }, false) => format!("{}{{{{\"{}\"}}}}", id, label),
            (NodeKind::Stage, false) => format!("{}[\"{}\"]", id, label),
        };
        lines.push(format!("    {}", shape));
    }

    if let Some(entry) = &graph.entry {
        lines.push(format!("    start_node --> {}", node_id(entry)));
    }

    for edge in &graph.edges {
        let from = node_id(edge.source());
        match edge {
            Edge::Static { to, .. } => lines.push(format!("    {} --> {}", from, node_id(to))),
            Edge::Conditional { branches, .. } => {
                for (label, to) in branches {
                    lines.push(format!(
                        "    {} -->|{}| {}",
                        from,
                        escape(label),
                        node_id(to)
                    ));
                }
            }
        }
    }

    for (from, to) in &graph.error_edges {
        lines.push(format!("    {} -.->|error| {}", node_id(from), node_id(to)));
    }

    for terminal in &graph.terminals {
        lines.push(format!("    {} --> end_node", node_id(terminal)));
    }

    let mut output = lines.join("\n");
    output.push('\n');
    output
}

impl CompiledGraph {
    /// Mermaid flowchart of this graph with default options
    pub fn to_mermaid(&self) -> String {
        visualize_mermaid(self.graph(), &VisualizationOptions::default())
    }
}

fn node_id(name: &str) -> String {
    if name == END {
        return "end_node".to_string();
    }
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("n_{}", sanitized)
}

fn escape(text: &str) -> String {
    text.replace('"', "#quot;")
}
