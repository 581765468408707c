//! Corps des NOTIFY GENA (`e:propertyset`)

use xmltree::Element;

use crate::errors::Result;
use crate::soap::xml_children;

/// Extrait les variables d'état d'un `propertyset`
///
/// Chaque élément enfant d'un `property` donne un couple (nom, valeur) ; les
/// éléments sans texte sont ignorés. Un nom répété garde la dernière
/// valeur, à la position de sa première occurrence : les valeurs ne sont
/// pas concaténées. Le texte d'une variable découpé en plusieurs nœuds
/// (texte, CDATA) est recollé.
pub fn parse_property_set(body: &str) -> Result<Vec<(String, String)>> {
    let root = Element::parse(body.trim().as_bytes())?;
    let mut variables: Vec<(String, String)> = Vec::new();

    for property in xml_children(&root).filter(|child| child.name == "property") {
        for variable in xml_children(property) {
            let Some(value) = variable.get_text() else {
                continue;
            };
            match variables.iter_mut().find(|(name, _)| *name == variable.name) {
                Some(entry) => entry.1 = value.into_owned(),
                None => variables.push((variable.name.clone(), value.into_owned())),
            }
        }
    }

    Ok(variables)
}
