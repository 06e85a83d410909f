//! KML and KMZ input.
//!
//! The document is read into a small element tree with `quick-xml` and
//! every `Placemark`, at any folder depth, becomes one feature.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

use super::archive;
use super::geometry::{Feature, FeatureCollection, Geometry, Position};
use crate::error::GisError;

#[derive(Debug, Default)]
struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn child_text(&self, name: &str) -> Option<String> {
        self.child(name)
            .map(|c| c.text.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

fn start_node(e: &BytesStart<'_>) -> Result<Node, GisError> {
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        attrs.push((key, attr.unescape_value()?.into_owned()));
    }
    Ok(Node {
        name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
        attrs,
        ..Node::default()
    })
}

fn parse_tree(xml: &[u8]) -> Result<Node, GisError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut stack = vec![Node::default()];

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => stack.push(start_node(&e)?),
            Event::Empty(e) => {
                let node = start_node(&e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Event::Text(t) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Event::End(_) => {
                if stack.len() > 1 {
                    if let Some(node) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(node);
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if stack.len() > 1 {
        let open = stack.pop().map(|n| n.name).unwrap_or_default();
        return Err(GisError::Truncated(open));
    }
    Ok(stack.swap_remove(0))
}

/// `lon,lat[,alt]` tuples separated by whitespace. A tuple that does not
/// parse becomes an empty position, which the sanitizer rejects.
fn parse_coordinates(text: &str) -> Vec<Position> {
    text.split_whitespace()
        .map(|tuple| {
            tuple
                .split(',')
                .filter(|p| !p.is_empty())
                .map(|p| p.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .unwrap_or_default()
        })
        .collect()
}

fn coordinates_of(node: &Node) -> Vec<Position> {
    node.child("coordinates")
        .map(|c| parse_coordinates(&c.text))
        .unwrap_or_default()
}

fn ring_of(boundary: &Node) -> Option<Vec<Position>> {
    boundary.child("LinearRing").map(coordinates_of)
}

fn is_geometry_element(name: &str) -> bool {
    matches!(
        name,
        "Point" | "LineString" | "LinearRing" | "Polygon" | "MultiGeometry"
    )
}

fn geometry_of(node: &Node) -> Option<Geometry> {
    match node.name.as_str() {
        "Point" => coordinates_of(node)
            .into_iter()
            .next()
            .map(|coordinates| Geometry::Point { coordinates }),
        "LineString" | "LinearRing" => Some(Geometry::LineString {
            coordinates: coordinates_of(node),
        }),
        "Polygon" => {
            let outer = node.child("outerBoundaryIs").and_then(ring_of)?;
            let mut rings = vec![outer];
            rings.extend(node.children_named("innerBoundaryIs").filter_map(ring_of));
            Some(Geometry::Polygon { coordinates: rings })
        }
        "MultiGeometry" => {
            let geometries = node
                .children
                .iter()
                .filter(|c| is_geometry_element(&c.name))
                .map(geometry_of)
                .collect::<Option<Vec<_>>>()?;
            Some(Geometry::GeometryCollection { geometries })
        }
        _ => None,
    }
}

fn extended_data(node: &Node, properties: &mut Map<String, Value>) {
    for data in node.children_named("Data") {
        if let Some(name) = data.attr("name") {
            let value = data.child_text("value").unwrap_or_default();
            properties.insert(name.to_string(), Value::String(value));
        }
    }
    for schema in node.children_named("SchemaData") {
        simple_data(schema, properties);
    }
    simple_data(node, properties);
}

fn simple_data(node: &Node, properties: &mut Map<String, Value>) {
    for data in node.children_named("SimpleData") {
        if let Some(name) = data.attr("name") {
            properties.insert(name.to_string(), Value::String(data.text.trim().to_string()));
        }
    }
}

fn placemark_feature(node: &Node) -> Feature {
    let mut properties = Map::new();
    if let Some(name) = node.child_text("name") {
        properties.insert("name".to_string(), Value::String(name));
    }
    if let Some(description) = node.child_text("description") {
        properties.insert("description".to_string(), Value::String(description));
    }
    if let Some(ext) = node.child("ExtendedData") {
        extended_data(ext, &mut properties);
    }

    let geometry = node
        .children
        .iter()
        .find(|c| is_geometry_element(&c.name))
        .and_then(geometry_of);

    Feature {
        id: node.attr("id").map(|id| Value::String(id.to_string())),
        geometry,
        properties,
    }
}

fn collect_placemarks(node: &Node, out: &mut Vec<Feature>) {
    for child in &node.children {
        if child.name == "Placemark" {
            out.push(placemark_feature(child));
        } else {
            collect_placemarks(child, out);
        }
    }
}

pub fn parse_kml(bytes: &[u8]) -> Result<FeatureCollection, GisError> {
    let text = std::str::from_utf8(bytes)?;
    let root = parse_tree(text.as_bytes())?;
    let mut features = Vec::new();
    collect_placemarks(&root, &mut features);
    Ok(FeatureCollection::new(features))
}

/// Unzip a KMZ and read its KML document, preferring `doc.kml`.
pub fn parse_kmz(bytes: &[u8]) -> Result<FeatureCollection, GisError> {
    let mut zip = archive::open(bytes)?;
    let kml_members: Vec<String> = archive::member_names(&zip)
        .into_iter()
        .filter(|n| n.to_ascii_lowercase().ends_with(".kml"))
        .collect();
    let member = kml_members
        .iter()
        .find(|n| n.rsplit('/').next() == Some("doc.kml"))
        .or_else(|| kml_members.first())
        .ok_or(GisError::MissingMember(".kml"))?
        .clone();
    let kml = archive::read_member(&mut zip, &member)?;
    parse_kml(&kml)
}
