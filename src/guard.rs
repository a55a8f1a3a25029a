use yrs::branch::Branch;
use yrs::{
    Any, ArrayRef, GetString, MapRef, Out, ReadTxn, TextRef, XmlElementRef, XmlFragmentRef,
    XmlTextRef,
};

/// Stable identity of a shared node for the lifetime of its doc.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SharedId(usize);

pub(crate) fn id_of<T: AsRef<Branch>>(shared: &T) -> SharedId {
    SharedId(shared.as_ref() as *const Branch as usize)
}

/// A shared container: the doc side of a controller.
#[derive(Clone, Debug)]
pub enum Shared {
    /// A key to value mapping container.
    Map(MapRef),
    /// An ordered sequence container.
    Array(ArrayRef),
}

impl Shared {
    pub(crate) fn id(&self) -> SharedId {
        match self {
            Shared::Map(m) => id_of(m),
            Shared::Array(a) => id_of(a),
        }
    }

    /// Returns the map container, if this is one.
    pub fn as_map(&self) -> Option<&MapRef> {
        match self {
            Shared::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the array container, if this is one.
    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Shared::Array(a) => Some(a),
            _ => None,
        }
    }

    pub(crate) fn to_out(&self) -> Out {
        match self {
            Shared::Map(m) => Out::YMap(m.clone()),
            Shared::Array(a) => Out::YArray(a.clone()),
        }
    }
}

/// An opaque leaf node: a doc type with its own internal operational
/// semantics that the bridge never mirrors structurally.
#[derive(Clone, Debug)]
pub enum Leaf {
    /// A collaborative text.
    Text(TextRef),
    /// A collaborative XML text node.
    XmlText(XmlTextRef),
    /// A collaborative XML element.
    XmlElement(XmlElementRef),
    /// A collaborative XML fragment.
    XmlFragment(XmlFragmentRef),
}

impl Leaf {
    pub(crate) fn id(&self) -> SharedId {
        match self {
            Leaf::Text(t) => id_of(t),
            Leaf::XmlText(t) => id_of(t),
            Leaf::XmlElement(e) => id_of(e),
            Leaf::XmlFragment(f) => id_of(f),
        }
    }

    /// Returns the text ref, if this leaf is one.
    pub fn as_text(&self) -> Option<&TextRef> {
        match self {
            Leaf::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Projects the leaf to its string form.
    pub fn get_string<T: ReadTxn>(&self, txn: &T) -> String {
        match self {
            Leaf::Text(t) => t.get_string(txn),
            Leaf::XmlText(t) => t.get_string(txn),
            Leaf::XmlElement(e) => e.get_string(txn),
            Leaf::XmlFragment(f) => f.get_string(txn),
        }
    }

    pub(crate) fn to_out(&self) -> Out {
        match self {
            Leaf::Text(t) => Out::YText(t.clone()),
            Leaf::XmlText(t) => Out::YXmlText(t.clone()),
            Leaf::XmlElement(e) => Out::YXmlElement(e.clone()),
            Leaf::XmlFragment(f) => Out::YXmlFragment(f.clone()),
        }
    }
}

/// A doc value classified for the bridge. Leaves are matched before
/// containers: a leaf must never be treated as a structural container.
pub(crate) enum Node {
    Map(MapRef),
    Array(ArrayRef),
    Leaf(Leaf),
    Primitive(Any),
    Other(Out),
}

pub(crate) fn classify(out: Out) -> Node {
    match out {
        Out::YText(t) => Node::Leaf(Leaf::Text(t)),
        Out::YXmlText(t) => Node::Leaf(Leaf::XmlText(t)),
        Out::YXmlElement(e) => Node::Leaf(Leaf::XmlElement(e)),
        Out::YXmlFragment(f) => Node::Leaf(Leaf::XmlFragment(f)),
        Out::YMap(m) => Node::Map(m),
        Out::YArray(a) => Node::Array(a),
        Out::Any(any) => Node::Primitive(any),
        other => Node::Other(other),
    }
}
