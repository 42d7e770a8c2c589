//! Storage seams for flow-owned records. The in-memory versions are what the mesh ships with;
//! a sled- or database-backed implementation can be swapped in without touching flow logic.

use dashmap::DashMap;
use std::sync::Mutex;

use super::info::ArchiveDocument;
use super::myth::{Persona, Post};
use crate::error::{MeshError, MeshResult};

pub trait DocumentRepository: Send + Sync {
    fn insert(&self, document: ArchiveDocument) -> MeshResult<()>;
    fn get(&self, id: &str) -> MeshResult<Option<ArchiveDocument>>;
    fn remove(&self, id: &str) -> MeshResult<bool>;
    fn all(&self) -> MeshResult<Vec<ArchiveDocument>>;
}

pub trait PostRepository: Send + Sync {
    /// Inserts or replaces by id.
    fn save(&self, post: Post) -> MeshResult<()>;
    fn get(&self, id: &str) -> MeshResult<Option<Post>>;
    fn all(&self) -> MeshResult<Vec<Post>>;
}

pub trait PersonaRepository: Send + Sync {
    fn insert(&self, persona: Persona) -> MeshResult<()>;
    fn get(&self, id: &str) -> MeshResult<Option<Persona>>;
    fn all(&self) -> MeshResult<Vec<Persona>>;
    fn active(&self) -> MeshResult<Option<Persona>>;
    /// Deactivates the current persona and activates `id` in one step.
    fn rotate(&self, id: &str) -> MeshResult<Persona>;
}

#[derive(Default)]
pub struct InMemoryDocumentRepository {
    documents: DashMap<String, ArchiveDocument>,
}

impl DocumentRepository for InMemoryDocumentRepository {
    fn insert(&self, document: ArchiveDocument) -> MeshResult<()> {
        self.documents.insert(document.id.clone(), document);
        Ok(())
    }

    fn get(&self, id: &str) -> MeshResult<Option<ArchiveDocument>> {
        Ok(self.documents.get(id).map(|d| d.clone()))
    }

    fn remove(&self, id: &str) -> MeshResult<bool> {
        Ok(self.documents.remove(id).is_some())
    }

    fn all(&self) -> MeshResult<Vec<ArchiveDocument>> {
        Ok(self.documents.iter().map(|d| d.value().clone()).collect())
    }
}

#[derive(Default)]
pub struct InMemoryPostRepository {
    posts: DashMap<String, Post>,
}

impl PostRepository for InMemoryPostRepository {
    fn save(&self, post: Post) -> MeshResult<()> {
        self.posts.insert(post.id.clone(), post);
        Ok(())
    }

    fn get(&self, id: &str) -> MeshResult<Option<Post>> {
        Ok(self.posts.get(id).map(|p| p.clone()))
    }

    fn all(&self) -> MeshResult<Vec<Post>> {
        Ok(self.posts.iter().map(|p| p.value().clone()).collect())
    }
}

/// Personas sit behind one mutex so rotation never exposes two active personas.
#[derive(Default)]
pub struct InMemoryPersonaRepository {
    personas: Mutex<Vec<Persona>>,
}

impl PersonaRepository for InMemoryPersonaRepository {
    fn insert(&self, persona: Persona) -> MeshResult<()> {
        let mut personas = self.personas.lock().unwrap_or_else(|p| p.into_inner());
        if persona.active {
            for p in personas.iter_mut() {
                p.active = false;
            }
        }
        personas.retain(|p| p.id != persona.id);
        personas.push(persona);
        Ok(())
    }

    fn get(&self, id: &str) -> MeshResult<Option<Persona>> {
        let personas = self.personas.lock().unwrap_or_else(|p| p.into_inner());
        Ok(personas.iter().find(|p| p.id == id).cloned())
    }

    fn all(&self) -> MeshResult<Vec<Persona>> {
        Ok(self.personas.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn active(&self) -> MeshResult<Option<Persona>> {
        let personas = self.personas.lock().unwrap_or_else(|p| p.into_inner());
        Ok(personas.iter().find(|p| p.active).cloned())
    }

    fn rotate(&self, id: &str) -> MeshResult<Persona> {
        let mut personas = self.personas.lock().unwrap_or_else(|p| p.into_inner());
        if !personas.iter().any(|p| p.id == id) {
            return Err(MeshError::NotFound(format!("persona {}", id)));
        }
        let mut activated = None;
        for p in personas.iter_mut() {
            p.active = p.id == id;
            if p.active {
                activated = Some(p.clone());
            }
        }
        activated.ok_or_else(|| MeshError::NotFound(format!("persona {}", id)))
    }
}
