use anyhow::Result;

use crate::{
    core::{
        error::{
            BasicError,
            InteractionError,
        },
        id::Id,
        invocation_policy::InvocationPolicy,
        match_style::MatchStyle,
        types::{
            HashMap,
            HashSet,
        },
        uri::Uri,
    },
};

/// A session that implements a registered procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Callee {
    pub session: Id,
    /// Whether the callee asked for callers to always be disclosed.
    pub disclose_caller: bool,
}

/// A procedure registration, possibly shared by multiple callees.
#[derive(Debug)]
pub struct Registration {
    pub id: Id,
    pub procedure: Uri,
    pub match_style: MatchStyle,
    pub invocation_policy: InvocationPolicy,
    callees: Vec<Callee>,
    next_callee: usize,
}

impl Registration {
    /// Callees, in order of registration.
    pub fn callees(&self) -> &[Callee] {
        &self.callees
    }

    fn select_callee(&mut self) -> Option<Callee> {
        if self.callees.is_empty() {
            return None;
        }
        let index = match self.invocation_policy {
            InvocationPolicy::Single | InvocationPolicy::First | InvocationPolicy::All => 0,
            InvocationPolicy::Last => self.callees.len() - 1,
            InvocationPolicy::RoundRobin => {
                let index = self.next_callee % self.callees.len();
                self.next_callee = index + 1;
                index
            }
            InvocationPolicy::Random => rand::random_range(0..self.callees.len()),
        };
        self.callees.get(index).cloned()
    }
}

/// Options of a REGISTER request.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterOptions {
    pub match_style: MatchStyle,
    pub invocation_policy: InvocationPolicy,
    pub force_reregister: bool,
    pub disclose_caller: bool,
}

/// A registration revoked in favor of a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedRegistration {
    pub registration: Id,
    pub callees: Vec<Id>,
}

/// The callee selected for a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub registration: Id,
    pub match_style: MatchStyle,
    pub callee: Callee,
}

/// A CALL forwarded to a callee as an INVOCATION, waiting for its YIELD or ERROR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvocation {
    pub caller: Id,
    pub call_request: Id,
    pub callee: Id,
    pub procedure: Uri,
    pub receive_progress: bool,
}

/// The dealer of a realm, which tracks registrations and pending invocations for RPC.
#[derive(Debug, Default)]
pub struct Dealer {
    registrations: HashMap<Id, Registration>,
    registrations_by_procedure: HashMap<(Uri, MatchStyle), Id>,
    // Wildcard registrations are looked up in registration order.
    wildcard_registrations: Vec<Id>,
    session_registrations: HashMap<Id, HashSet<Id>>,
    pending_invocations: HashMap<Id, PendingInvocation>,
    // Invocations whose caller left, mapped to the callee that may still answer them.
    abandoned_invocations: HashMap<Id, Id>,
}

impl Dealer {
    /// Registers a session as a callee of a procedure.
    ///
    /// A new registration takes the candidate ID. Joining a shared registration returns the
    /// existing ID. If an existing single registration is forcibly replaced, the revoked
    /// registration is returned, so that its callees can be notified.
    pub fn register(
        &mut self,
        session: Id,
        procedure: Uri,
        options: RegisterOptions,
        candidate: Id,
    ) -> Result<(Id, Option<RevokedRegistration>)> {
        self.check_register(session, &procedure, &options)?;

        let callee = Callee {
            session,
            disclose_caller: options.disclose_caller,
        };
        let key = (procedure.clone(), options.match_style);
        let mut revoked = None;
        if let Some(existing) = self.registrations_by_procedure.get(&key).cloned() {
            let registration = self
                .registrations
                .get_mut(&existing)
                .ok_or_else(|| BasicError::Internal("registration index is stale".to_owned()))?;
            if registration.invocation_policy == InvocationPolicy::Single {
                revoked = Some(self.revoke(existing));
            } else {
                registration.callees.push(callee);
                self.session_registrations
                    .entry(session)
                    .or_default()
                    .insert(existing);
                return Ok((existing, None));
            }
        }

        self.registrations.insert(
            candidate,
            Registration {
                id: candidate,
                procedure,
                match_style: options.match_style,
                invocation_policy: options.invocation_policy,
                callees: Vec::from_iter([callee]),
                next_callee: 0,
            },
        );
        self.registrations_by_procedure.insert(key, candidate);
        if options.match_style == MatchStyle::Wildcard {
            self.wildcard_registrations.push(candidate);
        }
        self.session_registrations
            .entry(session)
            .or_default()
            .insert(candidate);
        Ok((candidate, revoked))
    }

    /// Checks that a session could register a procedure, without registering it.
    ///
    /// A procedure held by a single callee can only be taken over with `force_reregister`. A
    /// shared registration can only be joined with the same invocation policy, once per session.
    pub fn check_register(
        &self,
        session: Id,
        procedure: &Uri,
        options: &RegisterOptions,
    ) -> Result<()> {
        if options.invocation_policy == InvocationPolicy::All {
            return Err(BasicError::InvalidArgument(
                "invocation policy \"all\" is not supported".to_owned(),
            )
            .into());
        }
        let Some(registration) = self
            .registrations_by_procedure
            .get(&(procedure.clone(), options.match_style))
            .and_then(|id| self.registrations.get(id))
        else {
            return Ok(());
        };
        let taken = if registration.invocation_policy == InvocationPolicy::Single {
            !options.force_reregister
        } else {
            registration.invocation_policy != options.invocation_policy
                || registration
                    .callees
                    .iter()
                    .any(|callee| callee.session == session)
        };
        if taken {
            return Err(InteractionError::ProcedureAlreadyExists.into());
        }
        Ok(())
    }

    fn revoke(&mut self, registration: Id) -> RevokedRegistration {
        let callees = match self.remove_registration(registration) {
            Some(removed) => removed
                .callees
                .into_iter()
                .map(|callee| callee.session)
                .collect(),
            None => Vec::default(),
        };
        for callee in &callees {
            if let Some(registrations) = self.session_registrations.get_mut(callee) {
                registrations.remove(&registration);
            }
        }
        RevokedRegistration {
            registration,
            callees,
        }
    }

    fn remove_registration(&mut self, registration: Id) -> Option<Registration> {
        let removed = self.registrations.remove(&registration)?;
        self.registrations_by_procedure
            .remove(&(removed.procedure.clone(), removed.match_style));
        self.wildcard_registrations.retain(|id| *id != registration);
        Some(removed)
    }

    /// Unregisters a session from a registration.
    ///
    /// Sessions cannot unregister each other's procedures.
    pub fn unregister(&mut self, session: Id, registration: Id) -> Result<()> {
        let registered = self
            .session_registrations
            .get_mut(&session)
            .is_some_and(|registrations| registrations.remove(&registration));
        if !registered {
            return Err(InteractionError::NoSuchRegistration.into());
        }
        self.remove_callee(session, registration);
        Ok(())
    }

    fn remove_callee(&mut self, session: Id, registration: Id) {
        let empty = match self.registrations.get_mut(&registration) {
            Some(entry) => {
                entry.callees.retain(|callee| callee.session != session);
                entry.callees.is_empty()
            }
            None => false,
        };
        if empty {
            self.remove_registration(registration);
        }
    }

    /// Looks up a registration by ID.
    pub fn registration(&self, id: Id) -> Option<&Registration> {
        self.registrations.get(&id)
    }

    fn lookup_id(&self, procedure: &Uri) -> Option<Id> {
        if let Some(id) = self
            .registrations_by_procedure
            .get(&(procedure.clone(), MatchStyle::Exact))
        {
            return Some(*id);
        }

        let prefix = self
            .registrations
            .values()
            .filter(|registration| {
                registration.match_style == MatchStyle::Prefix
                    && MatchStyle::Prefix
                        .matches(registration.procedure.as_str(), procedure.as_str())
            })
            .max_by_key(|registration| registration.procedure.as_str().len());
        if let Some(registration) = prefix {
            return Some(registration.id);
        }

        self.wildcard_registrations.iter().cloned().find(|id| {
            self.registrations.get(id).is_some_and(|registration| {
                MatchStyle::Wildcard.matches(registration.procedure.as_str(), procedure.as_str())
            })
        })
    }

    /// Looks up the registration that handles calls to the procedure.
    ///
    /// An exact registration wins over the longest matching prefix registration, which wins over
    /// the first matching wildcard registration.
    pub fn lookup(&self, procedure: &Uri) -> Option<&Registration> {
        self.lookup_id(procedure)
            .and_then(|id| self.registrations.get(&id))
    }

    /// Selects the callee for a call to the procedure.
    pub fn route(&mut self, procedure: &Uri) -> Option<Route> {
        let id = self.lookup_id(procedure)?;
        let registration = self.registrations.get_mut(&id)?;
        let callee = registration.select_callee()?;
        Some(Route {
            registration: id,
            match_style: registration.match_style,
            callee,
        })
    }

    /// Records an invocation sent to a callee.
    pub fn insert_pending(&mut self, invocation: Id, pending: PendingInvocation) {
        self.pending_invocations.insert(invocation, pending);
    }

    /// Looks up a pending invocation.
    pub fn pending(&self, invocation: Id) -> Option<&PendingInvocation> {
        self.pending_invocations.get(&invocation)
    }

    /// Removes a pending invocation.
    pub fn remove_pending(&mut self, invocation: Id) -> Option<PendingInvocation> {
        self.pending_invocations.remove(&invocation)
    }

    /// The number of invocations waiting for a final result.
    pub fn pending_count(&self) -> usize {
        self.pending_invocations.len()
    }

    /// Consumes a reply from a callee to an invocation abandoned by its caller.
    ///
    /// Returns whether the reply belongs to such an invocation and should be dropped. The
    /// invocation is forgotten once the callee sends its final reply.
    pub fn take_abandoned(&mut self, invocation: Id, callee: Id, last: bool) -> bool {
        if self.abandoned_invocations.get(&invocation) != Some(&callee) {
            return false;
        }
        if last {
            self.abandoned_invocations.remove(&invocation);
        }
        true
    }

    /// Removes every registration and pending invocation of a session.
    ///
    /// Invocations pending on the session as a callee are returned, so that their callers can be
    /// notified. Invocations pending on the session as a caller are returned as abandoned, so that
    /// their callees can be interrupted; later replies to them are accepted by
    /// [`Self::take_abandoned`].
    pub fn remove_session(&mut self, session: Id) -> RemovedInvocations {
        let registrations = self
            .session_registrations
            .remove(&session)
            .unwrap_or_default();
        for registration in registrations {
            self.remove_callee(session, registration);
        }
        self.abandoned_invocations
            .retain(|_, callee| *callee != session);

        let invocations = self
            .pending_invocations
            .iter()
            .filter(|(_, pending)| pending.callee == session || pending.caller == session)
            .map(|(invocation, _)| *invocation)
            .collect::<Vec<_>>();
        let mut removed = RemovedInvocations::default();
        for invocation in invocations {
            let Some(pending) = self.pending_invocations.remove(&invocation) else {
                continue;
            };
            if pending.callee == session {
                removed.canceled.push(pending);
            } else {
                self.abandoned_invocations.insert(invocation, pending.callee);
                removed.abandoned.push((invocation, pending));
            }
        }
        removed
    }
}

/// Pending invocations removed with a session.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RemovedInvocations {
    /// Invocations on the removed callee, whose callers are still waiting.
    pub canceled: Vec<PendingInvocation>,
    /// Invocations from the removed caller, keyed by invocation ID.
    pub abandoned: Vec<(Id, PendingInvocation)>,
}

#[cfg(test)]
mod dealer_test {
    use crate::{
        core::{
            error::{
                BasicError,
                InteractionError,
            },
            id::Id,
            invocation_policy::InvocationPolicy,
            match_style::MatchStyle,
            uri::Uri,
        },
        router::dealer::{
            Dealer,
            PendingInvocation,
            RegisterOptions,
            RevokedRegistration,
        },
    };

    fn id(value: u64) -> Id {
        Id::try_from(value).unwrap()
    }

    fn uri(value: &str) -> Uri {
        Uri::try_from(value).unwrap()
    }

    fn pattern(value: &str, match_style: MatchStyle) -> Uri {
        Uri::for_match(value, match_style).unwrap()
    }

    fn shared(policy: InvocationPolicy) -> RegisterOptions {
        RegisterOptions {
            invocation_policy: policy,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_duplicate_single_registration() {
        let mut dealer = Dealer::default();
        dealer
            .register(id(1), uri("com.add"), RegisterOptions::default(), id(100))
            .unwrap();
        assert_matches::assert_matches!(
            dealer
                .register(id(2), uri("com.add"), RegisterOptions::default(), id(101))
                .map_err(|err| err.downcast::<InteractionError>()),
            Err(Ok(InteractionError::ProcedureAlreadyExists))
        );
    }

    #[test]
    fn force_reregister_revokes_existing_registration() {
        let mut dealer = Dealer::default();
        dealer
            .register(id(1), uri("com.add"), RegisterOptions::default(), id(100))
            .unwrap();
        let (registration, revoked) = dealer
            .register(
                id(2),
                uri("com.add"),
                RegisterOptions {
                    force_reregister: true,
                    ..Default::default()
                },
                id(101),
            )
            .unwrap();
        pretty_assertions::assert_eq!(registration, id(101));
        pretty_assertions::assert_eq!(
            revoked,
            Some(RevokedRegistration {
                registration: id(100),
                callees: Vec::from_iter([id(1)]),
            })
        );
        assert_matches::assert_matches!(dealer.unregister(id(1), id(100)), Err(_));
        pretty_assertions::assert_eq!(dealer.lookup(&uri("com.add")).unwrap().id, id(101));
    }

    #[test]
    fn shared_registration_requires_same_policy() {
        let mut dealer = Dealer::default();
        let (first, _) = dealer
            .register(id(1), uri("com.add"), shared(InvocationPolicy::RoundRobin), id(100))
            .unwrap();
        let (second, _) = dealer
            .register(id(2), uri("com.add"), shared(InvocationPolicy::RoundRobin), id(101))
            .unwrap();
        pretty_assertions::assert_eq!(first, second);
        assert_matches::assert_matches!(
            dealer.register(id(3), uri("com.add"), shared(InvocationPolicy::Random), id(102)),
            Err(_)
        );
        assert_matches::assert_matches!(
            dealer
                .register(id(3), uri("com.add"), shared(InvocationPolicy::All), id(102))
                .map_err(|err| err.downcast::<BasicError>()),
            Err(Ok(BasicError::InvalidArgument(_)))
        );
    }

    #[test]
    fn round_robin_rotates_callees() {
        let mut dealer = Dealer::default();
        for session in 1..=3 {
            dealer
                .register(
                    id(session),
                    uri("com.add"),
                    shared(InvocationPolicy::RoundRobin),
                    id(100 + session),
                )
                .unwrap();
        }
        let callees = (0..4)
            .map(|_| dealer.route(&uri("com.add")).unwrap().callee.session)
            .collect::<Vec<_>>();
        pretty_assertions::assert_eq!(callees, Vec::from_iter([id(1), id(2), id(3), id(1)]));
    }

    #[test]
    fn first_and_last_policies_pick_ends() {
        let mut dealer = Dealer::default();
        for session in 1..=3 {
            dealer
                .register(id(session), uri("com.first"), shared(InvocationPolicy::First), id(100 + session))
                .unwrap();
            dealer
                .register(id(session), uri("com.last"), shared(InvocationPolicy::Last), id(200 + session))
                .unwrap();
        }
        pretty_assertions::assert_eq!(dealer.route(&uri("com.first")).unwrap().callee.session, id(1));
        pretty_assertions::assert_eq!(dealer.route(&uri("com.last")).unwrap().callee.session, id(3));
    }

    #[test]
    fn lookup_prefers_exact_then_longest_prefix_then_first_wildcard() {
        let mut dealer = Dealer::default();
        let wildcard = RegisterOptions {
            match_style: MatchStyle::Wildcard,
            ..Default::default()
        };
        let prefix = RegisterOptions {
            match_style: MatchStyle::Prefix,
            ..Default::default()
        };
        dealer
            .register(id(1), pattern("com..add", MatchStyle::Wildcard), wildcard, id(10))
            .unwrap();
        dealer
            .register(id(1), pattern("com.math.", MatchStyle::Wildcard), wildcard, id(11))
            .unwrap();
        dealer
            .register(id(1), pattern("com", MatchStyle::Prefix), prefix, id(20))
            .unwrap();
        dealer
            .register(id(1), pattern("com.math", MatchStyle::Prefix), prefix, id(21))
            .unwrap();
        dealer
            .register(id(1), uri("com.math.add"), RegisterOptions::default(), id(30))
            .unwrap();

        pretty_assertions::assert_eq!(dealer.lookup(&uri("com.math.add")).unwrap().id, id(30));
        pretty_assertions::assert_eq!(dealer.lookup(&uri("com.math.sub")).unwrap().id, id(21));
        pretty_assertions::assert_eq!(dealer.lookup(&uri("com.other")).unwrap().id, id(20));

        dealer.unregister(id(1), id(20)).unwrap();
        dealer.unregister(id(1), id(21)).unwrap();
        pretty_assertions::assert_eq!(dealer.lookup(&uri("com.math.add")).unwrap().id, id(30));
        pretty_assertions::assert_eq!(dealer.lookup(&uri("com.x.add")).unwrap().id, id(10));
        pretty_assertions::assert_eq!(dealer.lookup(&uri("com.math.sub")).unwrap().id, id(11));
        assert!(dealer.lookup(&uri("org.x")).is_none());
    }

    #[test]
    fn unregister_requires_ownership() {
        let mut dealer = Dealer::default();
        let (registration, _) = dealer
            .register(id(1), uri("com.add"), RegisterOptions::default(), id(100))
            .unwrap();
        assert_matches::assert_matches!(
            dealer
                .unregister(id(2), registration)
                .map_err(|err| err.downcast::<InteractionError>()),
            Err(Ok(InteractionError::NoSuchRegistration))
        );
        dealer.unregister(id(1), registration).unwrap();
        assert!(dealer.lookup(&uri("com.add")).is_none());
    }

    #[test]
    fn removing_callee_returns_its_pending_invocations() {
        let mut dealer = Dealer::default();
        dealer
            .register(id(1), uri("com.add"), RegisterOptions::default(), id(100))
            .unwrap();
        let pending = PendingInvocation {
            caller: id(2),
            call_request: id(9),
            callee: id(1),
            procedure: uri("com.add"),
            receive_progress: false,
        };
        dealer.insert_pending(id(500), pending.clone());
        dealer.insert_pending(
            id(501),
            PendingInvocation {
                callee: id(3),
                ..pending.clone()
            },
        );

        pretty_assertions::assert_eq!(
            dealer.remove_session(id(1)).canceled,
            Vec::from_iter([pending])
        );
        pretty_assertions::assert_eq!(dealer.pending_count(), 1);
        assert!(dealer.lookup(&uri("com.add")).is_none());
    }

    #[test]
    fn removing_caller_abandons_its_pending_invocations() {
        let mut dealer = Dealer::default();
        let pending = PendingInvocation {
            caller: id(2),
            call_request: id(9),
            callee: id(3),
            procedure: uri("com.add"),
            receive_progress: true,
        };
        dealer.insert_pending(id(500), pending.clone());

        let removed = dealer.remove_session(id(2));
        assert!(removed.canceled.is_empty());
        pretty_assertions::assert_eq!(removed.abandoned, Vec::from_iter([(id(500), pending)]));
        pretty_assertions::assert_eq!(dealer.pending_count(), 0);

        // Only the callee may answer, and only until its final reply.
        assert!(!dealer.take_abandoned(id(500), id(4), true));
        assert!(dealer.take_abandoned(id(500), id(3), false));
        assert!(dealer.take_abandoned(id(500), id(3), true));
        assert!(!dealer.take_abandoned(id(500), id(3), true));
    }

    #[test]
    fn removing_callee_forgets_abandoned_invocations() {
        let mut dealer = Dealer::default();
        dealer.insert_pending(
            id(500),
            PendingInvocation {
                caller: id(2),
                call_request: id(9),
                callee: id(3),
                procedure: uri("com.add"),
                receive_progress: false,
            },
        );
        dealer.remove_session(id(2));
        dealer.remove_session(id(3));
        assert!(!dealer.take_abandoned(id(500), id(3), true));
    }

    #[test]
    fn checks_registration_without_registering() {
        let mut dealer = Dealer::default();
        assert_matches::assert_matches!(
            dealer.check_register(id(1), &uri("com.add"), &RegisterOptions::default()),
            Ok(())
        );
        assert!(dealer.lookup(&uri("com.add")).is_none());

        dealer
            .register(id(1), uri("com.add"), RegisterOptions::default(), id(100))
            .unwrap();
        assert_matches::assert_matches!(
            dealer
                .check_register(id(2), &uri("com.add"), &RegisterOptions::default())
                .map_err(|err| err.downcast::<InteractionError>()),
            Err(Ok(InteractionError::ProcedureAlreadyExists))
        );
        assert_matches::assert_matches!(
            dealer.check_register(
                id(2),
                &uri("com.add"),
                &RegisterOptions {
                    force_reregister: true,
                    ..Default::default()
                }
            ),
            Ok(())
        );
    }
}
