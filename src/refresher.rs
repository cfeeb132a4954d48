//! Repository resolution and the workflow definition cache refresher.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;

use crate::providers::github::types::RepositoryName;
use crate::providers::github::GitHubClient;
use crate::state::{SharedState, WorkflowSnapshot};

/// Keeps the monitored repositories and their workflow definitions current.
pub struct Refresher {
    client: Arc<GitHubClient>,
    state: Arc<SharedState>,
    repositories: Vec<String>,
    organizations: Vec<String>,
}

/// Parses and deduplicates repository names, keeping the first occurrence.
fn unique_repositories<I, S>(names: I) -> Vec<RepositoryName>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for name in names {
        let name = name.as_ref().trim();
        match name.parse::<RepositoryName>() {
            Ok(repository) => {
                if seen.insert(repository.clone()) {
                    unique.push(repository);
                }
            }
            Err(e) => warn!("Skipping repository: {e}"),
        }
    }
    unique
}

impl Refresher {
    pub fn new(
        client: Arc<GitHubClient>,
        state: Arc<SharedState>,
        repositories: Vec<String>,
        organizations: Vec<String>,
    ) -> Self {
        Self {
            client,
            state,
            repositories,
            organizations,
        }
    }

    /// Resolves the monitored repositories.
    ///
    /// A non-empty explicit list wins and organizations are not enumerated.
    /// Otherwise every organization's repositories are listed; a failing
    /// organization contributes whatever was fetched before the failure.
    pub async fn resolve_repositories(&self) -> Vec<RepositoryName> {
        let explicit: Vec<&str> = self
            .repositories
            .iter()
            .map(String::as_str)
            .filter(|r| !r.trim().is_empty())
            .collect();
        if !explicit.is_empty() {
            debug!("Using {} configured repositories", explicit.len());
            return unique_repositories(explicit);
        }

        let mut discovered = Vec::new();
        for organization in self.organizations.iter().filter(|o| !o.is_empty()) {
            let fetched = self.client.org_repositories(organization).await;
            if let Some(e) = &fetched.error {
                warn!("Failed to list repositories of organization {organization}: {e}");
            }
            info!(
                "Fetched {} repositories for organization {organization}",
                fetched.items.len()
            );
            discovered.extend(fetched.items.into_iter().filter_map(|r| r.full_name));
        }

        unique_repositories(discovered)
    }

    /// Fetches the workflow definitions of `repositories` into a new snapshot.
    ///
    /// Repositories without any definition are left out.
    async fn fetch_workflows(&self, repositories: &[RepositoryName]) -> WorkflowSnapshot {
        let mut definitions = HashMap::new();
        for repository in repositories {
            let fetched = self.client.workflows(repository).await;
            if let Some(e) = &fetched.error {
                warn!("Failed to list workflows of {repository}: {e}");
            }

            let workflows: HashMap<_, _> = fetched.items.into_iter().map(|w| (w.id, w)).collect();
            if !workflows.is_empty() {
                definitions.insert(repository.clone(), workflows);
            }
        }
        WorkflowSnapshot::from_map(definitions)
    }

    /// Runs one refresh: resolve repositories, then rebuild the definition cache.
    pub async fn refresh(&self) {
        info!("Refreshing repositories and workflow definitions");

        let repositories = self.resolve_repositories().await;
        if repositories.is_empty() {
            warn!("No repositories to monitor, clearing workflow definitions");
            self.state.repositories.replace(Vec::new());
            self.state.workflows.clear();
            return;
        }

        self.state.repositories.replace(repositories.clone());
        let snapshot = self.fetch_workflows(&repositories).await;
        info!(
            "Workflow definitions updated: {} of {} repositories have workflows",
            snapshot.repository_count(),
            repositories.len()
        );
        self.state.workflows.replace(snapshot);
    }

    /// Refreshes immediately, then every `interval`.
    pub async fn run(self, interval: Duration) {
        info!(
            "Repositories and workflow definitions refresh every {}s",
            interval.as_secs()
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.refresh().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use mockito::{Matcher, Server};

    fn create_refresher(url: &str, repositories: &[&str], organizations: &[&str]) -> Refresher {
        let client = GitHubClient::new(url, Credentials::Anonymous, 0, Duration::from_secs(5)).unwrap();
        Refresher::new(
            Arc::new(client),
            Arc::new(SharedState::default()),
            repositories.iter().map(ToString::to_string).collect(),
            organizations.iter().map(ToString::to_string).collect(),
        )
    }

    fn names(repositories: &[RepositoryName]) -> Vec<&str> {
        repositories.iter().map(RepositoryName::as_str).collect()
    }

    #[test]
    fn test_unique_repositories_keeps_first_seen_order() {
        let unique = unique_repositories(["octo/b", "octo/a", "octo/b", "bad", "octo/c", "octo/a"]);
        assert_eq!(names(&unique), vec!["octo/b", "octo/a", "octo/c"]);
    }

    #[tokio::test]
    async fn test_explicit_list_wins_over_organizations() {
        let mut server = Server::new_async().await;
        let orgs = server
            .mock("GET", Matcher::Regex(r"^/orgs/".to_string()))
            .expect(0)
            .create_async()
            .await;

        let refresher = create_refresher(&server.url(), &["octo/app", "octo/lib", "octo/app"], &["octo"]);
        let resolved = refresher.resolve_repositories().await;

        orgs.assert_async().await;
        assert_eq!(names(&resolved), vec!["octo/app", "octo/lib"]);
    }

    #[tokio::test]
    async fn test_organizations_are_concatenated_and_deduplicated() {
        let mut server = Server::new_async().await;
        let _first = server
            .mock("GET", "/orgs/octo/repos")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"full_name": "octo/app"}, {"full_name": "shared/tool"}, {"full_name": null}]"#)
            .create_async()
            .await;
        let _second = server
            .mock("GET", "/orgs/shared/repos")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"full_name": "shared/tool"}, {"full_name": "shared/web"}]"#)
            .create_async()
            .await;

        let refresher = create_refresher(&server.url(), &[], &["octo", "shared"]);
        let resolved = refresher.resolve_repositories().await;

        assert_eq!(names(&resolved), vec!["octo/app", "shared/tool", "shared/web"]);
    }

    #[tokio::test]
    async fn test_refresh_builds_snapshot() {
        let mut server = Server::new_async().await;
        let _app = server
            .mock("GET", "/repos/octo/app/actions/workflows")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"workflows": [{"id": 1, "name": "CI", "node_id": "W_1", "state": "active"}]}"#)
            .create_async()
            .await;
        let _empty = server
            .mock("GET", "/repos/octo/empty/actions/workflows")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"workflows": []}"#)
            .create_async()
            .await;

        let refresher = create_refresher(&server.url(), &["octo/app", "octo/empty"], &[]);
        refresher.refresh().await;

        let app: RepositoryName = "octo/app".parse().unwrap();
        let snapshot = refresher.state.workflows.load();
        assert_eq!(refresher.state.repositories.load().len(), 2);
        assert_eq!(snapshot.repository_count(), 1);
        assert_eq!(
            snapshot.workflow(&app, 1).and_then(|w| w.name.as_deref()),
            Some("CI")
        );
    }

    #[tokio::test]
    async fn test_empty_resolution_clears_state() {
        let refresher = create_refresher("https://api.github.com", &[], &[]);
        refresher
            .state
            .repositories
            .replace(vec!["octo/app".parse().unwrap()]);
        refresher.state.workflows.replace(WorkflowSnapshot::from_map(HashMap::from([(
            "octo/app".parse().unwrap(),
            HashMap::new(),
        )])));

        refresher.refresh().await;

        assert!(refresher.state.repositories.load().is_empty());
        assert!(refresher.state.workflows.load().is_empty());
    }
}
