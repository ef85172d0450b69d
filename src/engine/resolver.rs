//! Referral chain resolution.

use super::handle::validate_handle;
use crate::datasource::{DataSourceError, ParticipantDirectory};
use crate::domain::{ChainLink, ChainStop, Generation, Participant, ParticipantId};
use std::sync::Arc;
use tracing::debug;

/// Ancestors of a purchaser and why the walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChain {
    pub links: Vec<ChainLink>,
    pub stop: ChainStop,
}

/// Walks `referrerHandle` links upward from a purchaser, at most three steps.
///
/// The walk stops without recording the candidate when the handle is absent,
/// invalid or unresolvable, when it resolves to the purchaser or to an
/// ancestor already recorded, or when the candidate's own referrer leads back
/// to a recorded ancestor. Inactive and banned ancestors are recorded as
/// suppressed and the walk continues past them.
#[derive(Debug, Clone)]
pub struct ChainResolver {
    directory: Arc<dyn ParticipantDirectory>,
}

impl ChainResolver {
    pub fn new(directory: Arc<dyn ParticipantDirectory>) -> Self {
        Self { directory }
    }

    pub async fn resolve(&self, purchaser: &Participant) -> Result<ResolvedChain, DataSourceError> {
        let mut links: Vec<ChainLink> = Vec::with_capacity(usize::from(Generation::MAX));
        let mut current = purchaser.clone();

        let stop = loop {
            let Some(generation) = Generation::new(links.len() as u8 + 1) else {
                break ChainStop::MaxDepth;
            };

            let Some(raw_handle) = current.referrer_handle.as_deref() else {
                break ChainStop::NoReferrer;
            };
            let handle = match validate_handle(raw_handle) {
                Ok(h) => h,
                Err(e) => {
                    debug!(participant = %current.id, handle = raw_handle, error = %e, "Invalid referrer handle");
                    break ChainStop::InvalidHandle(raw_handle.to_string());
                }
            };

            let Some(candidate) = self.directory.get_participant_by_handle(handle).await? else {
                break ChainStop::UnresolvedHandle(handle.to_string());
            };

            if candidate.id == purchaser.id {
                break ChainStop::SelfReferral;
            }
            if is_recorded(&links, &candidate.id) {
                break ChainStop::Cycle(candidate.id);
            }
            if let Some(ancestor) = self.loops_back(&candidate, &links).await? {
                break ChainStop::Cycle(ancestor);
            }

            links.push(ChainLink {
                generation,
                beneficiary_id: candidate.id.clone(),
                suppressed: candidate.is_suppressed(),
            });
            current = candidate;
        };

        debug!(
            purchaser = %purchaser.id,
            depth = links.len(),
            stop = ?stop,
            "Resolved referral chain"
        );
        Ok(ResolvedChain { links, stop })
    }

    /// The recorded ancestor that `candidate`'s own referrer resolves to, if any.
    async fn loops_back(
        &self,
        candidate: &Participant,
        links: &[ChainLink],
    ) -> Result<Option<ParticipantId>, DataSourceError> {
        if links.is_empty() {
            return Ok(None);
        }
        let Some(handle) = candidate
            .referrer_handle
            .as_deref()
            .and_then(|h| validate_handle(h).ok())
        else {
            return Ok(None);
        };

        Ok(self
            .directory
            .get_participant_by_handle(handle)
            .await?
            .map(|next| next.id)
            .filter(|id| is_recorded(links, id)))
    }
}

fn is_recorded(links: &[ChainLink], id: &ParticipantId) -> bool {
    links.iter().any(|l| &l.beneficiary_id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MockDirectory;
    use crate::domain::ParticipantStatus;

    fn resolver(participants: Vec<Participant>) -> ChainResolver {
        ChainResolver::new(Arc::new(MockDirectory::new().with_participants(participants)))
    }

    fn ids(chain: &ResolvedChain) -> Vec<&str> {
        chain.links.iter().map(|l| l.beneficiary_id.as_str()).collect()
    }

    fn p(id: &str) -> Participant {
        Participant::new(id, id)
    }

    #[tokio::test]
    async fn walks_three_generations() {
        let purchaser = p("p").referred_by("a");
        let r = resolver(vec![
            purchaser.clone(),
            p("a").referred_by("b"),
            p("b").referred_by("c"),
            p("c").referred_by("d"),
            p("d"),
        ]);

        let chain = r.resolve(&purchaser).await.unwrap();
        assert_eq!(ids(&chain), vec!["a", "b", "c"]);
        assert_eq!(chain.stop, ChainStop::MaxDepth);
        let gens: Vec<u8> = chain.links.iter().map(|l| l.generation.get()).collect();
        assert_eq!(gens, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stops_at_missing_referrer() {
        let purchaser = p("p").referred_by("a");
        let r = resolver(vec![purchaser.clone(), p("a")]);

        let chain = r.resolve(&purchaser).await.unwrap();
        assert_eq!(ids(&chain), vec!["a"]);
        assert_eq!(chain.stop, ChainStop::NoReferrer);
    }

    #[tokio::test]
    async fn two_node_loop_keeps_only_first_ancestor() {
        let purchaser = p("p").referred_by("a");
        let r = resolver(vec![
            purchaser.clone(),
            p("a").referred_by("b"),
            p("b").referred_by("a"),
        ]);

        let chain = r.resolve(&purchaser).await.unwrap();
        assert_eq!(ids(&chain), vec!["a"]);
        assert_eq!(chain.stop, ChainStop::Cycle(ParticipantId::new("a")));
    }

    #[tokio::test]
    async fn three_node_loop_stops_before_closing_member() {
        // c would be generation 3, but its referrer is a, already recorded.
        let purchaser = p("p").referred_by("a");
        let r = resolver(vec![
            purchaser.clone(),
            p("a").referred_by("b"),
            p("b").referred_by("c"),
            p("c").referred_by("a"),
        ]);

        let chain = r.resolve(&purchaser).await.unwrap();
        assert_eq!(ids(&chain), vec!["a", "b"]);
        assert_eq!(chain.stop, ChainStop::Cycle(ParticipantId::new("a")));
    }

    #[tokio::test]
    async fn loop_through_purchaser_records_every_other_member() {
        // The purchaser is never a recorded ancestor, so b is kept and the
        // walk ends when b's referrer turns out to be the purchaser.
        let purchaser = p("p").referred_by("a");
        let r = resolver(vec![
            purchaser.clone(),
            p("a").referred_by("b"),
            p("b").referred_by("p"),
        ]);

        let chain = r.resolve(&purchaser).await.unwrap();
        assert_eq!(ids(&chain), vec!["a", "b"]);
        assert_eq!(chain.stop, ChainStop::SelfReferral);
    }

    #[tokio::test]
    async fn purchaser_in_chain_stops_walk() {
        let purchaser = p("p").referred_by("a");
        let r = resolver(vec![purchaser.clone(), p("a").referred_by("p")]);

        let chain = r.resolve(&purchaser).await.unwrap();
        assert_eq!(ids(&chain), vec!["a"]);
        assert_eq!(chain.stop, ChainStop::SelfReferral);
    }

    #[tokio::test]
    async fn self_referral_yields_empty_chain() {
        let purchaser = p("p").referred_by("p");
        let r = resolver(vec![purchaser.clone()]);

        let chain = r.resolve(&purchaser).await.unwrap();
        assert!(chain.links.is_empty());
        assert_eq!(chain.stop, ChainStop::SelfReferral);
    }

    #[tokio::test]
    async fn invalid_and_unresolved_handles_stop() {
        let purchaser = p("p").referred_by("https://spam.example");
        let r = resolver(vec![purchaser.clone()]);
        let chain = r.resolve(&purchaser).await.unwrap();
        assert!(chain.links.is_empty());
        assert!(matches!(chain.stop, ChainStop::InvalidHandle(_)));

        let purchaser = p("p").referred_by("ghost");
        let r = resolver(vec![purchaser.clone()]);
        let chain = r.resolve(&purchaser).await.unwrap();
        assert_eq!(chain.stop, ChainStop::UnresolvedHandle("ghost".to_string()));
    }

    #[tokio::test]
    async fn suppressed_ancestor_is_recorded_and_walk_continues() {
        let purchaser = p("p").referred_by("a");
        let r = resolver(vec![
            purchaser.clone(),
            p("a").referred_by("b").with_status(ParticipantStatus::Banned),
            p("b"),
        ]);

        let chain = r.resolve(&purchaser).await.unwrap();
        assert_eq!(ids(&chain), vec!["a", "b"]);
        assert!(chain.links[0].suppressed);
        assert!(!chain.links[1].suppressed);
    }

    #[tokio::test]
    async fn directory_failure_propagates() {
        let r = ChainResolver::new(Arc::new(MockDirectory::new().unavailable()));
        let purchaser = p("p").referred_by("a");
        assert!(matches!(
            r.resolve(&purchaser).await,
            Err(DataSourceError::Unavailable(_))
        ));
    }
}
