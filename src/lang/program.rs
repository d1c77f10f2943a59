use super::node::Block;

/// Parsed Cinder program.
///
/// The statements of `body` form the implicit top-level function; variables
/// declared directly in it are the program's globals.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub body: Block,
    /// Number of node ids handed out by the parser (ids are `0..node_count`).
    pub node_count: u32,
}
