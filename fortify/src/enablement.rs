//! Host integrations a sandbox can be granted, and revert criteria.
//!
//! Every host-side change made for a sandbox is tagged with the
//! [`Enablement`] that required it. When a launcher exits, only the tags in
//! its [`Criteria`] are reverted; anything another live launcher for the
//! same user still depends on is left in place.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// A host integration, or one of the implicit lifetimes of host changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Enablement {
    /// Wayland compositor socket.
    Wayland,
    /// X11 display.
    X11,
    /// D-Bus session and system bus proxies.
    #[serde(rename = "dbus")]
    DBus,
    /// PulseAudio socket and cookie.
    Pulse,
    /// Lives as long as any launcher runs for the target user.
    User,
    /// Lives as long as this launcher runs.
    Process,
}

impl Enablement {
    /// Integrations a configuration can request.
    pub const CONFIGURABLE: [Self; 4] = [Self::Wayland, Self::X11, Self::DBus, Self::Pulse];

    /// Bit position.
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Display name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Wayland => "wayland",
            Self::X11 => "x11",
            Self::DBus => "dbus",
            Self::Pulse => "pulseaudio",
            Self::User => "user",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for Enablement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of [`Enablement`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Enablements(u8);

impl Enablements {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every enablement.
    pub const fn all() -> Self {
        Self(0b11_1111)
    }

    /// Whether `e` is in the set.
    pub const fn has(self, e: Enablement) -> bool {
        self.0 & e.bit() != 0
    }

    /// Adds `e`.
    pub const fn set(&mut self, e: Enablement) -> &mut Self {
        self.0 |= e.bit();
        self
    }

    /// Returns the set with `e` added.
    #[must_use]
    pub const fn with(self, e: Enablement) -> Self {
        Self(self.0 | e.bit())
    }

    /// Whether the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Enablement> {
        [
            Enablement::Wayland,
            Enablement::X11,
            Enablement::DBus,
            Enablement::Pulse,
            Enablement::User,
            Enablement::Process,
        ]
        .into_iter()
        .filter(move |e| self.has(*e))
    }
}

impl From<Enablement> for Enablements {
    fn from(e: Enablement) -> Self {
        Self(e.bit())
    }
}

impl FromIterator<Enablement> for Enablements {
    fn from_iter<I: IntoIterator<Item = Enablement>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl BitOr for Enablements {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Enablements {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Enablements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(no enablements)");
        }
        let names: Vec<_> = self.iter().map(Enablement::name).collect();
        f.write_str(&names.join(", "))
    }
}

impl Serialize for Enablements {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        for e in self.iter() {
            seq.serialize_element(&e)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Enablements {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        /// Accepts a list of names.
        struct SetVisitor;

        impl<'de> Visitor<'de> for SetVisitor {
            type Value = Enablements;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of enablement names")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Enablements, A::Error> {
                let mut set = Enablements::empty();
                while let Some(e) = seq.next_element::<Enablement>()? {
                    set.set(e);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_seq(SetVisitor)
    }
}

/// The enablements whose host changes a teardown reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Criteria(Enablements);

impl Criteria {
    /// Reverts everything.
    pub const fn all() -> Self {
        Self(Enablements::all())
    }

    /// Reverts exactly `set`.
    pub const fn only(set: Enablements) -> Self {
        Self(set)
    }

    /// Criteria for a launcher exiting while `others` remain registered for
    /// the same user, given each remaining launcher's enablements.
    ///
    /// [`Enablement::Process`] is always reverted, [`Enablement::User`] only
    /// when no other launcher remains, and each configurable integration
    /// only when no remaining launcher uses it.
    pub fn teardown<I>(others: I) -> Self
    where
        I: IntoIterator<Item = Enablements>,
    {
        let mut count = 0usize;
        let in_use = others.into_iter().fold(Enablements::empty(), |acc, e| {
            count += 1;
            acc | e
        });

        let mut set = Enablements::from(Enablement::Process);
        if count == 0 {
            set.set(Enablement::User);
        }
        for e in Enablement::CONFIGURABLE {
            if !in_use.has(e) {
                set.set(e);
            }
        }
        Self(set)
    }

    /// Whether changes tagged `e` are reverted.
    pub const fn has(self, e: Enablement) -> bool {
        self.0.has(e)
    }

    /// The underlying set.
    pub const fn set(self) -> Enablements {
        self.0
    }
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
