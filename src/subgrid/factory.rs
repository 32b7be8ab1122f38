use super::{BitmaskLeaf, CellAddress, ServerLeafSubGrid};
use crate::error::{Error, Result};

/// Builds the leaf variant a tree stores on its last level.
///
/// Nodes are generic over the leaf type, so substituting a different leaf
/// (server segments, plain bitmasks) never touches traversal code.
pub trait SubGridFactory<L>: Send + Sync {
    fn create_leaf(&self, level: u8, tree_levels: u8, origin: CellAddress) -> Result<L>;
}

fn check_leaf_level(level: u8, tree_levels: u8) -> Result<()> {
    if level != tree_levels {
        return Err(Error::InvalidArgument(format!(
            "leaf requested on level {} of a {} level tree",
            level, tree_levels
        )));
    }
    Ok(())
}

/// Creates segment-owning leaves for site model trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerLeafFactory;

impl SubGridFactory<ServerLeafSubGrid> for ServerLeafFactory {
    fn create_leaf(
        &self,
        level: u8,
        tree_levels: u8,
        origin: CellAddress,
    ) -> Result<ServerLeafSubGrid> {
        check_leaf_level(level, tree_levels)?;
        Ok(ServerLeafSubGrid::new(origin, level))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BitmaskLeafFactory;

impl SubGridFactory<BitmaskLeaf> for BitmaskLeafFactory {
    fn create_leaf(&self, level: u8, tree_levels: u8, origin: CellAddress) -> Result<BitmaskLeaf> {
        check_leaf_level(level, tree_levels)?;
        Ok(BitmaskLeaf::new(origin, level))
    }
}
