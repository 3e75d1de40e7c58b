//! Python test extraction
//!
//! Walks a tree-sitter-python syntax tree and emits one [`TestItem`] per
//! collectable test:
//!
//! - top-level `def test*` / `async def test*` => `Function`
//! - `class Test*` => `Class`, its `def test*` members => `Method`
//! - nested `class Test*` inside a test class are visited recursively
//!
//! Markers come from `@pytest.mark.<name>` and `@mark.<name>` decorators,
//! with or without call arguments. Class markers flow to the class's
//! methods, and a module-level `pytestmark` applies to every item.

use tree_sitter::{Node, Parser};

use crate::error::{FastCollectError, Result};
use crate::schema::TestItem;

const MODULE_MARK_NAME: &str = "pytestmark";

/// Parse Python source and extract its test items.
///
/// Syntax errors are tolerated: whatever tree-sitter recovers is still
/// walked, so a half-edited file keeps reporting its intact tests.
pub fn extract_tests(source: &str, file_path: &str) -> Result<Vec<TestItem>> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| FastCollectError::ParseFailure {
            message: format!("Failed to load Python grammar: {}", e),
        })?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| FastCollectError::ParseFailure {
            message: format!("Parser returned no tree for {}", file_path),
        })?;

    let root = tree.root_node();
    let extractor = Extractor { source, file_path };
    let module_markers = extractor.module_markers(&root);

    let mut items = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        extractor.visit(&child, &module_markers, None, &mut items);
    }
    Ok(items)
}

struct Extractor<'a> {
    source: &'a str,
    file_path: &'a str,
}

impl<'a> Extractor<'a> {
    fn text(&self, node: &Node) -> &'a str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    fn visit(&self, node: &Node, inherited: &[String], class: Option<&str>, out: &mut Vec<TestItem>) {
        let (definition, own_markers) = match node.kind() {
            "decorated_definition" => match node.child_by_field_name("definition") {
                Some(def) => (def, self.decorator_markers(node)),
                None => return,
            },
            "function_definition" | "class_definition" => (*node, Vec::new()),
            _ => return,
        };

        let Some(name_node) = definition.child_by_field_name("name") else {
            return;
        };
        let name = self.text(&name_node);
        let line = definition.start_position().row + 1;

        let mut markers = inherited.to_vec();
        markers.extend(own_markers);

        match definition.kind() {
            "function_definition" if name.starts_with("test") => {
                let item = match class {
                    Some(class) => TestItem::method(name, class, self.file_path, line),
                    None => TestItem::function(name, self.file_path, line),
                };
                out.push(item.with_markers(markers));
            }
            "class_definition" if name.starts_with("Test") => {
                out.push(TestItem::class(name, self.file_path, line).with_markers(markers.clone()));

                if let Some(body) = definition.child_by_field_name("body") {
                    let mut cursor = body.walk();
                    for member in body.named_children(&mut cursor) {
                        self.visit(&member, &markers, Some(name), out);
                    }
                }
            }
            _ => {}
        }
    }

    fn decorator_markers(&self, decorated: &Node) -> Vec<String> {
        let mut markers = Vec::new();
        let mut cursor = decorated.walk();
        for decorator in decorated.named_children(&mut cursor) {
            if decorator.kind() != "decorator" {
                continue;
            }
            if let Some(expr) = decorator.named_child(0) {
                if let Some(marker) = self.marker_name(&expr) {
                    markers.push(marker);
                }
            }
        }
        markers
    }

    /// `pytestmark = pytest.mark.x` or `pytestmark = [pytest.mark.a, ...]`
    fn module_markers(&self, root: &Node) -> Vec<String> {
        let mut markers = Vec::new();
        let mut cursor = root.walk();
        for statement in root.named_children(&mut cursor) {
            if statement.kind() != "expression_statement" {
                continue;
            }
            let Some(assignment) = statement.named_child(0) else {
                continue;
            };
            if assignment.kind() != "assignment" {
                continue;
            }
            let is_module_mark = assignment
                .child_by_field_name("left")
                .is_some_and(|left| self.text(&left) == MODULE_MARK_NAME);
            if !is_module_mark {
                continue;
            }
            let Some(right) = assignment.child_by_field_name("right") else {
                continue;
            };

            match right.kind() {
                "list" | "tuple" => {
                    let mut inner = right.walk();
                    for element in right.named_children(&mut inner) {
                        markers.extend(self.marker_name(&element));
                    }
                }
                _ => markers.extend(self.marker_name(&right)),
            }
        }
        markers
    }

    fn marker_name(&self, expr: &Node) -> Option<String> {
        let target = if expr.kind() == "call" {
            expr.child_by_field_name("function")?
        } else {
            *expr
        };
        let dotted: String = self
            .text(&target)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        let name = dotted
            .strip_prefix("pytest.mark.")
            .or_else(|| dotted.strip_prefix("mark."))?;

        let is_identifier = !name.is_empty()
            && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        is_identifier.then(|| name.to_string())
    }
}
