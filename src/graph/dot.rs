use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use crate::core::TaskBank;
use crate::graph::{Node, NodeKey, StateFlowGraph};

/// Graphviz rendering of a [`StateFlowGraph`].
///
/// * **Red** box: the initial node
/// * Double border: latest owner of at least one state
/// * Dotted edge: dependency only, no data flows
pub struct DotGraph<'a, B: TaskBank> {
    graph: &'a StateFlowGraph<B>,
    rankdir: Option<&'a str>,
    embed_states_threshold: usize,
    owners: HashSet<NodeKey>,
}

/// `n_{name}_{launch}` for names that are valid identifiers. Other names are
/// sanitized and suffixed with the storage index, since sanitizing alone can
/// map two names to the same id.
fn node_id<R>(key: NodeKey, node: &Node<R>) -> String {
    let name = &node.meta.name;
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return format!("n_{}_{}", name, node.launch_id);
    }

    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("n_{}_{}_x{}", name, node.launch_id, key.index())
}

fn escape_record(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '{' | '}' | '|' | '<' | '>' | '"') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl<B: TaskBank> DotGraph<'_, B> {
    fn embeds_states<R>(&self, node: &Node<R>) -> bool {
        let outputs = node.meta.output_states.len();
        !node.is_initial_node && outputs > 0 && outputs <= self.embed_states_threshold
    }

    fn style<R>(&self, key: NodeKey, node: &Node<R>) -> String {
        let mut style = String::new();
        if node.is_initial_node {
            style.push_str(" style=filled fillcolor=red");
        }
        if self.owners.contains(&key) {
            style.push_str(" peripheries=2");
        }
        style
    }
}

impl<B: TaskBank> Display for DotGraph<'_, B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let graph = self.graph;

        writeln!(f, "digraph {{")?;
        if let Some(rankdir) = self.rankdir {
            writeln!(f, "  rankdir={rankdir}")?;
        }
        writeln!(f)?;

        for &key in graph.node_keys() {
            let node = graph.node(key);
            let id = node_id(key, node);
            let style = self.style(key, node);

            if self.embeds_states(node) {
                let ports: Vec<String> = node
                    .meta
                    .output_states
                    .iter()
                    .map(|state| format!("<{0}> {0}", state.name()))
                    .collect();
                writeln!(
                    f,
                    "  {id} [label=\"{{ {} | {{ {} }} }}\" shape=record{style}]",
                    escape_record(&node.to_string()),
                    ports.join(" | ")
                )?;
            } else {
                let label = node.to_string().replace('"', "\\\"");
                writeln!(f, "  {id} [label=\"{label}\" shape=box{style}]")?;
            }
        }

        writeln!(f)?;

        for &key in graph.node_keys() {
            let node = graph.node(key);
            let embedded = self.embeds_states(node);

            for (state, targets) in node.output_edges.iter() {
                let from_port = embedded && node.meta.output_states.contains(&state);
                let source = if from_port {
                    format!("{}:{}", node_id(key, node), state.name())
                } else {
                    node_id(key, node)
                };

                for &target in targets {
                    let Some(target_node) = graph.nodes.get(target) else {
                        tracing::warn!("{} has an edge on {} to a deleted node", node, state);
                        continue;
                    };

                    let mut attributes = Vec::new();
                    if !from_port {
                        attributes.push(format!("label=\"{state}\""));
                    }
                    if !node.has_state_flow(state, target_node) {
                        attributes.push("style=dotted".to_string());
                    }

                    write!(f, "  {source} -> {}", node_id(target, target_node))?;
                    if !attributes.is_empty() {
                        write!(f, " [{}]", attributes.join(" "))?;
                    }
                    writeln!(f)?;
                }
            }
        }

        writeln!(f, "}}")
    }
}

impl<B: TaskBank> StateFlowGraph<B> {
    /// Renders the graph in Graphviz DOT format.
    ///
    /// Nodes with at least one and at most `embed_states_threshold` output
    /// states are drawn as records with one port per state, and their edges
    /// leave from the port of the state instead of carrying a label.
    pub fn dump_dot(&self, rankdir: Option<&str>, embed_states_threshold: usize) -> String {
        self.dot(rankdir, embed_states_threshold).to_string()
    }

    pub fn dot<'a>(&'a self, rankdir: Option<&'a str>, embed_states_threshold: usize) -> DotGraph<'a, B> {
        let owners = self
            .latest_state_owner
            .iter()
            .filter(|(state, owner)| {
                let live = self.nodes.contains(**owner);
                if !live {
                    tracing::warn!("Latest owner of {} is not in the graph", state);
                }
                live
            })
            .map(|(_, &owner)| owner)
            .collect();

        DotGraph {
            graph: self,
            rankdir,
            embed_states_threshold,
            owners,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::testing::*;

    #[test]
    fn test_single_writer() {
        let mut graph = graph_with(vec![serial("foo").writes(value(1))]);
        graph.insert_tasks(launches(&["foo"]), false);

        let expected = "\
digraph {
  rankdir=LR

  n_initial_state_0 [label=\"[node: initial_state:0]\" shape=box style=filled fillcolor=red]
  n_foo_0 [label=\"[node: foo:0]\" shape=box peripheries=2]

  n_initial_state_0 -> n_foo_0 [label=\"S1_value\" style=dotted]
}
";
        assert_eq!(graph.dump_dot(Some("LR"), 0), expected);
    }

    #[test]
    fn test_embedded_states() {
        let mut graph = graph_with(vec![
            serial("foo").writes(value(1)),
            serial("bar").reads(value(1)).writes(value(2)),
        ]);
        graph.insert_tasks(launches(&["foo", "bar", "foo"]), false);

        let expected = "\
digraph {

  n_initial_state_0 [label=\"[node: initial_state:0]\" shape=box style=filled fillcolor=red]
  n_foo_0 [label=\"{ [node: foo:0] | { <S1_value> S1_value } }\" shape=record]
  n_bar_0 [label=\"{ [node: bar:0] | { <S2_value> S2_value } }\" shape=record peripheries=2]
  n_foo_1 [label=\"{ [node: foo:1] | { <S1_value> S1_value } }\" shape=record peripheries=2]

  n_initial_state_0 -> n_foo_0 [label=\"S1_value\" style=dotted]
  n_initial_state_0 -> n_bar_0 [label=\"S2_value\" style=dotted]
  n_foo_0:S1_value -> n_bar_0
  n_foo_0:S1_value -> n_foo_1 [style=dotted]
  n_bar_0 -> n_foo_1 [label=\"S1_value\" style=dotted]
}
";
        assert_eq!(graph.dump_dot(None, 1), expected);
    }

    #[test]
    fn test_sanitized_names_stay_distinct() {
        let mut graph = graph_with(vec![
            range_for("a").writes(value(0)),
            range_for("b").writes(value(1)),
            serial("a_b").reads(value(0)),
        ]);
        graph.insert_tasks(launches(&["a", "b", "a_b"]), false);
        graph.fuse();

        let fused = graph.key_at(1);
        assert_eq!(graph.node(fused).to_string(), "[node: a+b:0]");
        let fused_id = format!("n_a_b_0_x{}", fused.index());

        let dot = graph.dump_dot(Some("TB"), 0);
        assert!(dot.contains(&format!("  {fused_id} [label=\"[node: a+b:0]\" shape=box peripheries=2]\n")));
        assert!(dot.contains("  n_a_b_0 [label=\"[node: a_b:0]\" shape=box]\n"));
        assert!(dot.contains(&format!("  {fused_id} -> n_a_b_0 [label=\"S0_value\"]\n")));
        assert!(dot.contains("  rankdir=TB\n"));
    }
}
