/// Resolves the pages that render a content entity.
///
/// Implementations return every URL whose cached HTML may show the entity: its permalink, the
/// taxonomy and author archives it appears in, its date archives, and the home page when pinned.
pub trait EntityResolver: Send + Sync {
    fn related_urls(&self, entity_id: u64) -> Vec<String>;
}

/// Resolver for deployments without a content source. Entity purges remove nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEntities;

impl EntityResolver for NoEntities {
    fn related_urls(&self, _entity_id: u64) -> Vec<String> {
        Vec::new()
    }
}
