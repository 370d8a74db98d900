use anyhow::Result;

use crate::{
    auth::Identity,
    core::{
        error::InteractionError,
        id::Id,
        match_style::MatchStyle,
        types::{
            HashMap,
            HashSet,
        },
        uri::Uri,
    },
    message::message::PublishMessage,
};

/// A subscription shared by every session subscribed to the same topic with the same match style.
#[derive(Debug)]
pub struct Subscription {
    pub id: Id,
    pub topic: Uri,
    pub match_style: MatchStyle,
    subscribers: HashSet<Id>,
}

impl Subscription {
    /// Sessions subscribed.
    pub fn subscribers(&self) -> impl Iterator<Item = &Id> {
        self.subscribers.iter()
    }
}

/// A point-in-time copy of a subscription matching a published topic.
///
/// Events are dispatched from the snapshot, so the subscription may change during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: Id,
    pub match_style: MatchStyle,
    pub subscribers: Vec<Id>,
}

/// The broker of a realm, which tracks subscriptions for pub/sub.
#[derive(Debug, Default)]
pub struct Broker {
    subscriptions: HashMap<Id, Subscription>,
    subscriptions_by_topic: HashMap<(Uri, MatchStyle), Id>,
    session_subscriptions: HashMap<Id, HashSet<Id>>,
}

impl Broker {
    /// Subscribes a session to a topic.
    ///
    /// The first subscriber of a topic creates the subscription with the candidate ID. Later
    /// subscribers share the existing subscription.
    pub fn subscribe(
        &mut self,
        session: Id,
        topic: Uri,
        match_style: MatchStyle,
        candidate: Id,
    ) -> Id {
        let id = *self
            .subscriptions_by_topic
            .entry((topic.clone(), match_style))
            .or_insert(candidate);
        self.subscriptions
            .entry(id)
            .or_insert_with(|| Subscription {
                id,
                topic,
                match_style,
                subscribers: HashSet::default(),
            })
            .subscribers
            .insert(session);
        self.session_subscriptions
            .entry(session)
            .or_default()
            .insert(id);
        id
    }

    /// Unsubscribes a session from a subscription.
    pub fn unsubscribe(&mut self, session: Id, subscription: Id) -> Result<()> {
        let subscribed = self
            .session_subscriptions
            .get_mut(&session)
            .is_some_and(|subscriptions| subscriptions.remove(&subscription));
        if !subscribed {
            return Err(InteractionError::NoSuchSubscription.into());
        }
        self.remove_subscriber(session, subscription);
        Ok(())
    }

    fn remove_subscriber(&mut self, session: Id, subscription: Id) {
        let empty = match self.subscriptions.get_mut(&subscription) {
            Some(entry) => {
                entry.subscribers.remove(&session);
                entry.subscribers.is_empty()
            }
            None => false,
        };
        if empty {
            if let Some(entry) = self.subscriptions.remove(&subscription) {
                self.subscriptions_by_topic
                    .remove(&(entry.topic, entry.match_style));
            }
        }
    }

    /// Removes every subscription of a session.
    pub fn remove_session(&mut self, session: Id) {
        let subscriptions = self
            .session_subscriptions
            .remove(&session)
            .unwrap_or_default();
        for subscription in subscriptions {
            self.remove_subscriber(session, subscription);
        }
    }

    /// Looks up a subscription by ID.
    pub fn subscription(&self, id: Id) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    /// Snapshots every subscription that matches the published topic.
    pub fn matching_subscriptions(&self, topic: &Uri) -> Vec<SubscriptionSnapshot> {
        self.subscriptions
            .values()
            .filter(|subscription| {
                subscription
                    .match_style
                    .matches(subscription.topic.as_str(), topic.as_str())
            })
            .map(|subscription| SubscriptionSnapshot {
                id: subscription.id,
                match_style: subscription.match_style,
                subscribers: subscription.subscribers.iter().cloned().collect(),
            })
            .collect()
    }
}

/// Decides which sessions receive a publication, based on the publisher's options.
#[derive(Debug)]
pub struct ReceiverFilter {
    publisher: Id,
    exclude_me: bool,
    exclude: HashSet<Id>,
    exclude_authid: HashSet<String>,
    exclude_authrole: HashSet<String>,
    eligible: Option<HashSet<Id>>,
    eligible_authid: Option<HashSet<String>>,
    eligible_authrole: Option<HashSet<String>>,
}

impl ReceiverFilter {
    pub fn new(publisher: Id, message: &PublishMessage) -> Self {
        Self {
            publisher,
            exclude_me: message.exclude_me(),
            exclude: message.exclude().into_iter().collect(),
            exclude_authid: message.exclude_authid().into_iter().collect(),
            exclude_authrole: message.exclude_authrole().into_iter().collect(),
            eligible: message
                .eligible()
                .map(|eligible| eligible.into_iter().collect()),
            eligible_authid: message
                .eligible_authid()
                .map(|eligible| eligible.into_iter().collect()),
            eligible_authrole: message
                .eligible_authrole()
                .map(|eligible| eligible.into_iter().collect()),
        }
    }

    /// Checks if the session should receive the publication.
    pub fn allows(&self, session: Id, identity: &Identity) -> bool {
        let any_eligible = self.eligible.is_some()
            || self.eligible_authid.is_some()
            || self.eligible_authrole.is_some();
        if any_eligible {
            let eligible = self
                .eligible
                .as_ref()
                .is_some_and(|eligible| eligible.contains(&session))
                || self
                    .eligible_authid
                    .as_ref()
                    .is_some_and(|eligible| eligible.contains(&identity.id))
                || self
                    .eligible_authrole
                    .as_ref()
                    .is_some_and(|eligible| eligible.contains(&identity.role));
            if !eligible {
                return false;
            }
        }

        if self.exclude.contains(&session)
            || self.exclude_authid.contains(&identity.id)
            || self.exclude_authrole.contains(&identity.role)
        {
            return false;
        }

        !(self.exclude_me && session == self.publisher)
    }
}

#[cfg(test)]
mod broker_test {
    use crate::{
        auth::Identity,
        core::{
            error::InteractionError,
            id::Id,
            match_style::MatchStyle,
            types::{
                Dictionary,
                List,
                Value,
            },
            uri::Uri,
        },
        message::message::PublishMessage,
        router::broker::{
            Broker,
            ReceiverFilter,
        },
    };

    fn id(value: u64) -> Id {
        Id::try_from(value).unwrap()
    }

    fn uri(value: &str) -> Uri {
        Uri::try_from(value).unwrap()
    }

    fn identity(id: &str, role: &str) -> Identity {
        Identity {
            id: id.to_owned(),
            role: role.to_owned(),
        }
    }

    #[test]
    fn shares_subscription_per_topic_and_match_style() {
        let mut broker = Broker::default();
        let first = broker.subscribe(id(1), uri("com.x"), MatchStyle::Exact, id(100));
        let second = broker.subscribe(id(2), uri("com.x"), MatchStyle::Exact, id(101));
        let prefix = broker.subscribe(id(2), uri("com.x"), MatchStyle::Prefix, id(102));
        pretty_assertions::assert_eq!(first, id(100));
        pretty_assertions::assert_eq!(second, id(100));
        pretty_assertions::assert_eq!(prefix, id(102));

        let mut matching = broker.matching_subscriptions(&uri("com.x"));
        matching.sort_by_key(|subscription| subscription.id);
        pretty_assertions::assert_eq!(matching.len(), 2);
        let mut subscribers = matching[0].subscribers.clone();
        subscribers.sort();
        pretty_assertions::assert_eq!(subscribers, Vec::from_iter([id(1), id(2)]));
        pretty_assertions::assert_eq!(matching[1].match_style, MatchStyle::Prefix);
    }

    #[test]
    fn matches_patterns() {
        let mut broker = Broker::default();
        broker.subscribe(id(1), uri("com.x"), MatchStyle::Prefix, id(100));
        broker.subscribe(id(1), uri("com..update"), MatchStyle::Wildcard, id(101));
        pretty_assertions::assert_eq!(
            broker
                .matching_subscriptions(&uri("com.x.y"))
                .into_iter()
                .map(|subscription| subscription.id)
                .collect::<Vec<_>>(),
            Vec::from_iter([id(100)])
        );
        pretty_assertions::assert_eq!(
            broker
                .matching_subscriptions(&uri("com.y.update"))
                .into_iter()
                .map(|subscription| subscription.id)
                .collect::<Vec<_>>(),
            Vec::from_iter([id(101)])
        );
        assert!(broker.matching_subscriptions(&uri("org.x")).is_empty());
    }

    #[test]
    fn drops_subscription_after_last_unsubscribe() {
        let mut broker = Broker::default();
        let subscription = broker.subscribe(id(1), uri("com.x"), MatchStyle::Exact, id(100));
        broker.subscribe(id(2), uri("com.x"), MatchStyle::Exact, id(101));

        broker.unsubscribe(id(1), subscription).unwrap();
        assert!(broker.subscription(subscription).is_some());
        broker.remove_session(id(2));
        assert!(broker.subscription(subscription).is_none());
        assert!(broker.matching_subscriptions(&uri("com.x")).is_empty());

        let resubscribed = broker.subscribe(id(3), uri("com.x"), MatchStyle::Exact, id(102));
        pretty_assertions::assert_eq!(resubscribed, id(102));
    }

    #[test]
    fn unsubscribe_requires_membership() {
        let mut broker = Broker::default();
        let subscription = broker.subscribe(id(1), uri("com.x"), MatchStyle::Exact, id(100));
        assert_matches::assert_matches!(
            broker
                .unsubscribe(id(2), subscription)
                .map_err(|err| err.downcast::<InteractionError>()),
            Err(Ok(InteractionError::NoSuchSubscription))
        );
        assert_matches::assert_matches!(broker.unsubscribe(id(1), id(5)), Err(_));
    }

    #[test]
    fn filter_excludes_publisher_by_default() {
        let filter = ReceiverFilter::new(id(1), &PublishMessage::default());
        assert!(!filter.allows(id(1), &identity("a", "user")));
        assert!(filter.allows(id(2), &identity("b", "user")));

        let filter = ReceiverFilter::new(
            id(1),
            &PublishMessage {
                options: Dictionary::from_iter([("exclude_me".to_owned(), Value::Bool(false))]),
                ..Default::default()
            },
        );
        assert!(filter.allows(id(1), &identity("a", "user")));
    }

    #[test]
    fn filter_applies_eligible_union_then_exclusions() {
        let filter = ReceiverFilter::new(
            id(1),
            &PublishMessage {
                options: Dictionary::from_iter([
                    (
                        "eligible".to_owned(),
                        Value::List(List::from_iter([Value::Integer(2)])),
                    ),
                    (
                        "eligible_authrole".to_owned(),
                        Value::List(List::from_iter([Value::from("admin")])),
                    ),
                    (
                        "exclude_authid".to_owned(),
                        Value::List(List::from_iter([Value::from("mallory")])),
                    ),
                ]),
                ..Default::default()
            },
        );
        assert!(filter.allows(id(2), &identity("b", "user")));
        assert!(filter.allows(id(3), &identity("c", "admin")));
        assert!(!filter.allows(id(4), &identity("d", "user")));
        assert!(!filter.allows(id(5), &identity("mallory", "admin")));
    }
}
