//! Client-side breakpoint tracking and synchronization.
//!
//! The synchronizer owns nothing: breakpoint descriptors belong to the host
//! environment and outlive any single session. It keeps the set of
//! descriptors this session cares about, diffs it against what has been
//! pushed to each connected server, and issues `setBreakpoints` calls
//! grouped by source file, writing server-assigned ids and verification
//! state back onto the descriptors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::client::DapClient;
use crate::config::FileFilter;
use crate::dap::types::{
    Breakpoint, Capabilities, SetBreakpointsArguments, Source, SourceBreakpoint,
};
use crate::error::SyncError;

/// A position in a source file; lines are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    pub path: PathBuf,
    pub line: u32,
}

/// Server confirmation state of one breakpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Verification {
    #[default]
    Unverified,
    Verified,
    Invalid(Option<String>),
}

/// A client-side breakpoint. Identity fields (path, line, condition,
/// enabled) are immutable; only the server-assigned id and verification
/// state mutate, and only through server responses.
#[derive(Debug)]
pub struct BreakpointDescriptor {
    path: PathBuf,
    line: u32,
    condition: Option<String>,
    enabled: bool,
    state: Mutex<RuntimeState>,
}

#[derive(Debug, Default)]
struct RuntimeState {
    server_id: Option<i64>,
    verification: Verification,
}

impl BreakpointDescriptor {
    pub fn new(path: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
            condition: None,
            enabled: true,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            path: self.path.clone(),
            line: self.line,
        }
    }

    /// The id the server assigned in its last `setBreakpoints` response, if
    /// any.
    pub fn server_id(&self) -> Option<i64> {
        self.state.lock().server_id
    }

    pub fn verification(&self) -> Verification {
        self.state.lock().verification.clone()
    }

    /// Reset to the pre-session state. Called by hosts between sessions.
    pub fn reset(&self) {
        *self.state.lock() = RuntimeState::default();
    }

    /// Write one server-reported breakpoint back onto this descriptor.
    /// Last writer wins when several servers report for the same
    /// descriptor.
    fn apply(&self, reported: &Breakpoint) {
        let mut state = self.state.lock();
        if reported.id.is_some() {
            state.server_id = reported.id;
        }
        state.verification = if reported.verified {
            Verification::Verified
        } else {
            Verification::Invalid(reported.message.clone())
        };
    }
}

/// The per-source-file projection used for wire calls. An empty entry list
/// is meaningful: it clears every breakpoint the server holds for the
/// source.
#[derive(Debug, Clone)]
pub struct SourceBreakpointGroup {
    pub path: PathBuf,
    pub entries: Vec<GroupEntry>,
}

#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub line: u32,
    pub condition: Option<String>,
    /// `None` for temporary breakpoints, which have no descriptor to write
    /// verification state back onto.
    pub descriptor: Option<Arc<BreakpointDescriptor>>,
}

/// An ephemeral add/remove instruction merged into exactly one
/// synchronization pass and then discarded. Used for run-to-line style
/// navigation.
#[derive(Debug, Clone)]
struct TemporaryBreakpoint {
    position: SourcePosition,
    add: bool,
}

/// The capability seam between a session and the synchronizer: which
/// breakpoints the session can install, and how a source group becomes a
/// wire call.
pub trait SessionBreakpointPolicy: Send + Sync {
    /// Whether this session can install the given breakpoint.
    fn supports_breakpoint(&self, breakpoint: &BreakpointDescriptor) -> bool;

    /// Project one per-source group into `setBreakpoints` arguments.
    fn to_wire_group(&self, group: &SourceBreakpointGroup) -> SetBreakpointsArguments {
        SetBreakpointsArguments {
            source: source_of(&group.path),
            breakpoints: group
                .entries
                .iter()
                .map(|entry| SourceBreakpoint {
                    line: entry.line,
                    condition: entry.condition.clone(),
                })
                .collect(),
            lines: group.entries.iter().map(|entry| entry.line).collect(),
            source_modified: false,
        }
    }
}

fn source_of(path: &Path) -> Source {
    Source {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        path: Some(path.to_string_lossy().into_owned()),
    }
}

/// Default policy: install any enabled breakpoint whose file the session's
/// mapping rules accept.
pub struct DefaultBreakpointPolicy {
    filter: FileFilter,
}

impl DefaultBreakpointPolicy {
    pub fn new(filter: FileFilter) -> Self {
        Self { filter }
    }
}

impl SessionBreakpointPolicy for DefaultBreakpointPolicy {
    fn supports_breakpoint(&self, breakpoint: &BreakpointDescriptor) -> bool {
        (self.filter)(breakpoint.path())
    }
}

pub struct BreakpointSynchronizer {
    policy: Arc<dyn SessionBreakpointPolicy>,
    tracked: RwLock<Vec<Arc<BreakpointDescriptor>>>,
    servers: RwLock<Vec<DapClient>>,
}

impl BreakpointSynchronizer {
    pub fn new(policy: Arc<dyn SessionBreakpointPolicy>) -> Self {
        Self {
            policy,
            tracked: RwLock::new(Vec::new()),
            servers: RwLock::new(Vec::new()),
        }
    }

    /// Track a breakpoint and push the updated set. A disabled breakpoint,
    /// or one the session's policy rejects, is a no-op.
    pub async fn register(&self, breakpoint: &Arc<BreakpointDescriptor>) -> Vec<SyncError> {
        if !(breakpoint.enabled() && self.policy.supports_breakpoint(breakpoint)) {
            return Vec::new();
        }
        self.tracked.write().push(Arc::clone(breakpoint));
        self.send_breakpoints(None, None).await
    }

    /// Stop tracking a breakpoint. The pass always carries a removal
    /// instruction so a source left without breakpoints is cleared on the
    /// servers before it is dropped.
    pub async fn unregister(
        &self,
        breakpoint: &Arc<BreakpointDescriptor>,
        _temporary: bool,
    ) -> Vec<SyncError> {
        if !self.policy.supports_breakpoint(breakpoint) {
            return Vec::new();
        }
        self.tracked
            .write()
            .retain(|tracked| !Arc::ptr_eq(tracked, breakpoint));
        self.send_breakpoints(
            None,
            Some(TemporaryBreakpoint {
                position: breakpoint.position(),
                add: false,
            }),
        )
        .await
    }

    /// Inject a one-shot breakpoint for exactly the next pass.
    pub async fn register_temporary(&self, position: SourcePosition) -> Vec<SyncError> {
        self.send_breakpoints(None, Some(TemporaryBreakpoint { position, add: true }))
            .await
    }

    /// Retract a one-shot breakpoint: clears its source on the servers when
    /// no tracked breakpoint remains there.
    pub async fn unregister_temporary(&self, position: SourcePosition) -> Vec<SyncError> {
        self.send_breakpoints(None, Some(TemporaryBreakpoint { position, add: false }))
            .await
    }

    /// Add a newly connected server endpoint and immediately push the full
    /// current breakpoint set to it (and it alone).
    pub async fn initialize(
        &self,
        server: &DapClient,
        _capabilities: &Capabilities,
    ) -> Vec<SyncError> {
        self.servers.write().push(server.clone());
        self.send_breakpoints(Some(server.id()), None).await
    }

    pub fn remove_server(&self, server_id: u64) {
        self.servers.write().retain(|s| s.id() != server_id);
    }

    /// Snapshot of the tracked set.
    pub fn tracked(&self) -> Vec<Arc<BreakpointDescriptor>> {
        self.tracked.read().clone()
    }

    /// Reconcile a server-sent `breakpoint` event (reason `changed`) onto
    /// the descriptor carrying that server-assigned id.
    pub fn apply_breakpoint_event(&self, reported: &Breakpoint) {
        let Some(id) = reported.id else {
            return;
        };
        let tracked = self.tracked.read();
        if let Some(descriptor) = tracked.iter().find(|bp| bp.server_id() == Some(id)) {
            descriptor.apply(reported);
        }
    }

    /// One synchronization pass: project the tracked set (plus any
    /// temporary instruction) into per-source groups and fan the calls out
    /// to the target servers. The returned failures are per server/source;
    /// the pass itself always runs to completion.
    async fn send_breakpoints(
        &self,
        only_server: Option<u64>,
        temporary: Option<TemporaryBreakpoint>,
    ) -> Vec<SyncError> {
        // Snapshots taken at pass start; registrations arriving mid-pass
        // land in the next pass.
        let servers: Vec<DapClient> = match only_server {
            Some(id) => self
                .servers
                .read()
                .iter()
                .filter(|s| s.id() == id)
                .cloned()
                .collect(),
            None => self.servers.read().clone(),
        };
        if servers.is_empty() {
            return Vec::new();
        }
        let tracked = self.tracked();

        let groups = project_groups(&tracked, temporary.as_ref());

        let mut calls = tokio::task::JoinSet::new();
        for group in groups.into_values() {
            let arguments = self.policy.to_wire_group(&group);
            for server in &servers {
                let server = server.clone();
                let arguments = arguments.clone();
                let entries = group.entries.clone();
                let tracked = tracked.clone();
                let path = group.path.clone();
                calls.spawn(async move {
                    match server.set_breakpoints(arguments).await {
                        Ok(body) => {
                            apply_response(&entries, &tracked, &body.breakpoints);
                            Ok(())
                        }
                        Err(err) => Err(SyncError {
                            request: "setBreakpoints",
                            server: server.id(),
                            path: Some(path),
                            message: err.to_string(),
                        }),
                    }
                });
            }
        }

        // Fan-in: every per-source, per-server call completes or fails
        // independently.
        let mut failures = Vec::new();
        while let Some(joined) = calls.join_next().await {
            if let Ok(Err(err)) = joined {
                tracing::warn!(target: "tether.dap", "{err}");
                failures.push(err);
            }
        }
        failures
    }
}

/// Project tracked breakpoints into per-source groups. A removal-only
/// temporary whose source has no tracked breakpoints still yields an empty
/// group, so the server clears the source; the group is not tracked beyond
/// this pass.
fn project_groups(
    tracked: &[Arc<BreakpointDescriptor>],
    temporary: Option<&TemporaryBreakpoint>,
) -> BTreeMap<PathBuf, SourceBreakpointGroup> {
    let mut groups: BTreeMap<PathBuf, SourceBreakpointGroup> = BTreeMap::new();
    for breakpoint in tracked {
        groups
            .entry(breakpoint.path().to_path_buf())
            .or_insert_with(|| SourceBreakpointGroup {
                path: breakpoint.path().to_path_buf(),
                entries: Vec::new(),
            })
            .entries
            .push(GroupEntry {
                line: breakpoint.line(),
                condition: breakpoint.condition().map(str::to_string),
                descriptor: Some(Arc::clone(breakpoint)),
            });
    }

    if let Some(temporary) = temporary {
        let group = groups
            .entry(temporary.position.path.clone())
            .or_insert_with(|| SourceBreakpointGroup {
                path: temporary.position.path.clone(),
                entries: Vec::new(),
            });
        if temporary.add {
            group.entries.push(GroupEntry {
                line: temporary.position.line,
                condition: None,
                descriptor: None,
            });
        }
    }

    groups
}

/// Correlate response breakpoints back onto descriptors.
///
/// When a response breakpoint carries an explicit source path and line,
/// match by source+line against the tracked set. Otherwise fall back to the
/// request order: same index, same breakpoint. The fallback is best-effort
/// and can mis-map if a server reorders results without echoing source and
/// line; the protocol gives no ordering guarantee to lean on.
fn apply_response(
    entries: &[GroupEntry],
    tracked: &[Arc<BreakpointDescriptor>],
    reported: &[Breakpoint],
) {
    for (index, report) in reported.iter().enumerate() {
        let explicit_path = report
            .source
            .as_ref()
            .and_then(|source| source.path.as_deref());
        let descriptor = match (explicit_path, report.line) {
            (Some(path), Some(line)) => {
                let path = Path::new(path);
                tracked
                    .iter()
                    .find(|bp| bp.path() == path && bp.line() == line)
                    .cloned()
            }
            _ => entries.get(index).and_then(|entry| entry.descriptor.clone()),
        };
        if let Some(descriptor) = descriptor {
            descriptor.apply(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(path: &str, line: u32) -> Arc<BreakpointDescriptor> {
        Arc::new(BreakpointDescriptor::new(path, line))
    }

    fn reported(
        id: Option<i64>,
        verified: bool,
        message: Option<&str>,
        source: Option<&str>,
        line: Option<u32>,
    ) -> Breakpoint {
        Breakpoint {
            id,
            verified,
            message: message.map(str::to_string),
            source: source.map(|path| Source {
                name: None,
                path: Some(path.to_string()),
            }),
            line,
        }
    }

    #[test]
    fn positional_correlation_when_response_omits_source_and_line() {
        let bp3 = descriptor("a.py", 3);
        let bp7 = descriptor("a.py", 7);
        let tracked = vec![Arc::clone(&bp3), Arc::clone(&bp7)];
        let entries: Vec<GroupEntry> = tracked
            .iter()
            .map(|bp| GroupEntry {
                line: bp.line(),
                condition: None,
                descriptor: Some(Arc::clone(bp)),
            })
            .collect();

        apply_response(
            &entries,
            &tracked,
            &[
                reported(Some(10), true, None, None, None),
                reported(None, false, Some("x"), None, None),
            ],
        );

        assert_eq!(bp3.server_id(), Some(10));
        assert_eq!(bp3.verification(), Verification::Verified);
        assert_eq!(bp7.server_id(), None);
        assert_eq!(
            bp7.verification(),
            Verification::Invalid(Some("x".to_string()))
        );
    }

    #[test]
    fn source_line_match_wins_over_position_when_present() {
        let bp3 = descriptor("a.py", 3);
        let bp7 = descriptor("a.py", 7);
        let tracked = vec![Arc::clone(&bp3), Arc::clone(&bp7)];
        let entries: Vec<GroupEntry> = tracked
            .iter()
            .map(|bp| GroupEntry {
                line: bp.line(),
                condition: None,
                descriptor: Some(Arc::clone(bp)),
            })
            .collect();

        // The server answers in reverse order but echoes source and line.
        apply_response(
            &entries,
            &tracked,
            &[
                reported(Some(2), true, None, Some("a.py"), Some(7)),
                reported(Some(1), true, None, Some("a.py"), Some(3)),
            ],
        );

        assert_eq!(bp3.server_id(), Some(1));
        assert_eq!(bp7.server_id(), Some(2));
    }

    #[test]
    fn surplus_response_entries_are_ignored() {
        let bp = descriptor("a.py", 3);
        let entries = vec![GroupEntry {
            line: 3,
            condition: None,
            descriptor: Some(Arc::clone(&bp)),
        }];
        apply_response(
            &entries,
            &[Arc::clone(&bp)],
            &[
                reported(Some(1), true, None, None, None),
                reported(Some(2), true, None, None, None),
            ],
        );
        assert_eq!(bp.server_id(), Some(1));
    }

    #[test]
    fn projection_groups_by_source_file() {
        let tracked = vec![
            descriptor("a.py", 3),
            descriptor("b.py", 1),
            descriptor("a.py", 7),
        ];
        let groups = project_groups(&tracked, None);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[Path::new("a.py")].entries.len(), 2);
        assert_eq!(groups[Path::new("b.py")].entries.len(), 1);
    }

    #[test]
    fn removal_temporary_for_emptied_source_yields_empty_group() {
        let temporary = TemporaryBreakpoint {
            position: SourcePosition {
                path: PathBuf::from("a.py"),
                line: 3,
            },
            add: false,
        };
        let groups = project_groups(&[], Some(&temporary));
        assert_eq!(groups.len(), 1);
        assert!(groups[Path::new("a.py")].entries.is_empty());
    }

    #[test]
    fn added_temporary_joins_the_tracked_entries_of_its_source() {
        let tracked = vec![descriptor("a.py", 3)];
        let temporary = TemporaryBreakpoint {
            position: SourcePosition {
                path: PathBuf::from("a.py"),
                line: 12,
            },
            add: true,
        };
        let groups = project_groups(&tracked, Some(&temporary));
        let group = &groups[Path::new("a.py")];
        assert_eq!(group.entries.len(), 2);
        assert!(group.entries[1].descriptor.is_none());
        assert_eq!(group.entries[1].line, 12);
    }

    #[test]
    fn wire_group_carries_lines_and_conditions() {
        let bp = Arc::new(BreakpointDescriptor::new("src/app.py", 9).with_condition("x > 1"));
        let groups = project_groups(&[bp], None);
        let policy = DefaultBreakpointPolicy::new(crate::config::accept_all_files());
        let arguments = policy.to_wire_group(&groups[Path::new("src/app.py")]);
        assert_eq!(arguments.source.name.as_deref(), Some("app.py"));
        assert_eq!(arguments.source.path.as_deref(), Some("src/app.py"));
        assert_eq!(arguments.lines, vec![9]);
        assert_eq!(arguments.breakpoints[0].condition.as_deref(), Some("x > 1"));
        assert!(!arguments.source_modified);
    }

    #[test]
    fn breakpoint_event_matches_by_server_id() {
        let bp = descriptor("a.py", 3);
        let synchronizer = BreakpointSynchronizer::new(Arc::new(DefaultBreakpointPolicy::new(
            crate::config::accept_all_files(),
        )));
        synchronizer.tracked.write().push(Arc::clone(&bp));

        // No id assigned yet: event has nothing to match.
        synchronizer.apply_breakpoint_event(&reported(Some(10), true, None, None, None));
        assert_eq!(bp.verification(), Verification::Unverified);

        bp.apply(&reported(Some(10), false, Some("pending"), None, None));
        synchronizer.apply_breakpoint_event(&reported(Some(10), true, None, None, None));
        assert_eq!(bp.verification(), Verification::Verified);
    }

    #[tokio::test]
    async fn register_respects_enabled_flag_and_policy() {
        let synchronizer = BreakpointSynchronizer::new(Arc::new(DefaultBreakpointPolicy::new(
            Arc::new(|path: &Path| path.extension().is_some_and(|ext| ext == "py")),
        )));

        let disabled = Arc::new(BreakpointDescriptor::new("a.py", 1).disabled());
        synchronizer.register(&disabled).await;
        assert!(synchronizer.tracked().is_empty());

        let unsupported = descriptor("a.rs", 1);
        synchronizer.register(&unsupported).await;
        assert!(synchronizer.tracked().is_empty());

        let supported = descriptor("a.py", 1);
        synchronizer.register(&supported).await;
        assert_eq!(synchronizer.tracked().len(), 1);
    }
}
