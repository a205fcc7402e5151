//! Class index table and treatment recommendations.
//!
//! Both detection models were trained on the same nine tomato-leaf classes, in
//! this order. Indices outside the table map to [`UNKNOWN_LABEL`].

use serde::{Deserialize, Serialize};

pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiseaseClass {
    EarlyBlight,
    Healthy,
    LateBlight,
    LeafMiner,
    LeafMold,
    MosaicVirus,
    Septoria,
    SpiderMites,
    YellowLeafCurlVirus,
}

impl DiseaseClass {
    /// Model output order.
    pub const ALL: [DiseaseClass; 9] = [
        DiseaseClass::EarlyBlight,
        DiseaseClass::Healthy,
        DiseaseClass::LateBlight,
        DiseaseClass::LeafMiner,
        DiseaseClass::LeafMold,
        DiseaseClass::MosaicVirus,
        DiseaseClass::Septoria,
        DiseaseClass::SpiderMites,
        DiseaseClass::YellowLeafCurlVirus,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.label() == label)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DiseaseClass::EarlyBlight => "Early Blight",
            DiseaseClass::Healthy => "Healthy",
            DiseaseClass::LateBlight => "Late Blight",
            DiseaseClass::LeafMiner => "Leaf Miner",
            DiseaseClass::LeafMold => "Leaf Mold",
            DiseaseClass::MosaicVirus => "Mosaic Virus",
            DiseaseClass::Septoria => "Septoria",
            DiseaseClass::SpiderMites => "Spider Mites",
            DiseaseClass::YellowLeafCurlVirus => "Yellow Leaf Curl Virus",
        }
    }

    pub fn recommendations(&self) -> &'static [&'static str] {
        match self {
            DiseaseClass::EarlyBlight => &[
                "Remove infected leaves immediately",
                "Apply copper-based fungicides",
                "Maintain proper plant spacing for airflow",
                "Avoid overhead watering to prevent spore spread",
            ],
            DiseaseClass::LateBlight => &[
                "Remove and destroy all infected plant material",
                "Apply fungicides preventively in humid conditions",
                "Ensure good air circulation around plants",
                "Use resistant varieties in future plantings",
            ],
            DiseaseClass::LeafMiner => &[
                "Remove and destroy affected leaves",
                "Use yellow sticky traps to monitor and catch adults",
                "Apply neem oil or insecticidal soap",
                "Introduce natural predators like parasitic wasps",
            ],
            DiseaseClass::LeafMold => &[
                "Improve air circulation around plants",
                "Reduce humidity in growing environment",
                "Apply fungicides at first sign of infection",
                "Avoid overhead watering to keep foliage dry",
            ],
            DiseaseClass::MosaicVirus => &[
                "Remove and destroy infected plants completely",
                "Control aphids and other insects that spread the virus",
                "Wash hands and tools after handling infected plants",
                "Plant resistant varieties in future",
            ],
            DiseaseClass::Septoria => &[
                "Remove infected leaves to prevent spread",
                "Apply fungicide at first sign of infection",
                "Maintain proper plant spacing",
                "Avoid overhead watering to keep foliage dry",
            ],
            DiseaseClass::SpiderMites => &[
                "Spray plants with strong stream of water to dislodge mites",
                "Apply insecticidal soap or neem oil to affected areas",
                "Increase humidity around plants",
                "Introduce predatory mites as biological control",
            ],
            DiseaseClass::YellowLeafCurlVirus => &[
                "Remove and destroy all infected plants",
                "Control whitefly populations with sticky traps",
                "Use reflective mulches to repel whiteflies",
                "Plant resistant varieties in future",
            ],
            DiseaseClass::Healthy => &[
                "Continue regular maintenance",
                "Monitor plants regularly for early signs of disease",
                "Maintain proper watering and fertilization schedule",
                "Ensure good air circulation around plants",
            ],
        }
    }
}

pub const FALLBACK_RECOMMENDATIONS: [&str; 3] = [
    "Consult with a plant pathologist for specific recommendations",
    "Monitor the plant closely for changes in symptoms",
    "Ensure proper growing conditions (light, water, nutrients)",
];

/// Label for a model output index; out-of-range indices are `"Unknown"`.
pub fn label_for_index(index: usize) -> &'static str {
    match DiseaseClass::from_index(index) {
        Some(class) => class.label(),
        None => UNKNOWN_LABEL,
    }
}

/// Ordered recommendations for a label, or the generic list for anything
/// outside the table.
pub fn recommendations_for(label: &str) -> Vec<String> {
    let list: &[&str] = match DiseaseClass::from_label(label) {
        Some(class) => class.recommendations(),
        None => &FALLBACK_RECOMMENDATIONS,
    };
    list.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_table_order() {
        assert_eq!(label_for_index(0), "Early Blight");
        assert_eq!(label_for_index(1), "Healthy");
        assert_eq!(label_for_index(2), "Late Blight");
        assert_eq!(label_for_index(8), "Yellow Leaf Curl Virus");
    }

    #[test]
    fn test_out_of_range_index_is_unknown() {
        assert_eq!(label_for_index(9), UNKNOWN_LABEL);
        assert_eq!(label_for_index(usize::MAX), UNKNOWN_LABEL);
    }

    #[test]
    fn test_every_class_has_four_recommendations() {
        for class in DiseaseClass::ALL {
            assert_eq!(class.recommendations().len(), 4, "{:?}", class);
            assert_eq!(DiseaseClass::from_label(class.label()), Some(class));
        }
    }

    #[test]
    fn test_unknown_label_gets_fallback() {
        let recs = recommendations_for(UNKNOWN_LABEL);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0], FALLBACK_RECOMMENDATIONS[0]);
    }

    #[test]
    fn test_healthy_recommendations_are_ordered() {
        let recs = recommendations_for("Healthy");
        assert_eq!(recs[0], "Continue regular maintenance");
        assert_eq!(recs[3], "Ensure good air circulation around plants");
    }
}
