//! Restart durability: pending mutations, sync metadata, and cached
//! content must survive dropping and reopening the tree.
